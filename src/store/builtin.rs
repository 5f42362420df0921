//! Ready-made middleware.
//!
//! | Middleware | Effect |
//! |------------|--------|
//! | [`Logger`] | traces every action with its outcome and duration |
//! | [`PingPong`] | answers a `"ping"` message with `"pong"` |
//! | [`ErrorBoundary`] | recovers downstream failures except invariant violations |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::client::ClientSender;
use crate::error::{Error, Result};

use super::action::Action;
use super::client_state::actions;
use super::dispatcher::StoreState;
use super::middleware::{Middleware, MiddlewareContext, Next};

// ============================================================================
// Logger
// ============================================================================

/// Traces every action before and after the rest of the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct Logger;

#[async_trait]
impl<S: StoreState> Middleware<S> for Logger {
    async fn handle(&self, ctx: &MiddlewareContext<S>, next: Next<S>) -> Result<()> {
        let started = Instant::now();
        debug!(action = %ctx.action(), "Action dispatched");

        let result = next.run().await;
        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

        match &result {
            Ok(()) => {
                debug!(action = %ctx.action(), elapsed_us, "Action settled");
                if let Ok(state) = serde_json::to_string(&*ctx.store().snapshot()) {
                    trace!(action = %ctx.action(), %state, "Store state");
                }
            }
            Err(e) => debug!(action = %ctx.action(), elapsed_us, error = %e, "Action failed"),
        }
        result
    }
}

// ============================================================================
// PingPong
// ============================================================================

/// Inbound keepalive frame.
pub const PING: &str = "ping";

/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// Replies `"pong"` to every `message` action whose payload is `"ping"`,
/// then continues the chain.
#[derive(Debug, Clone)]
pub struct PingPong {
    sender: ClientSender,
}

impl PingPong {
    /// Creates the middleware replying through `sender`.
    #[inline]
    #[must_use]
    pub fn new(sender: ClientSender) -> Self {
        Self { sender }
    }

    fn is_ping(action: &Action) -> bool {
        action.kind() == actions::MESSAGE && action.payload().and_then(Value::as_str) == Some(PING)
    }
}

#[async_trait]
impl<S: StoreState> Middleware<S> for PingPong {
    async fn handle(&self, ctx: &MiddlewareContext<S>, next: Next<S>) -> Result<()> {
        if Self::is_ping(ctx.action()) {
            trace!("Answering ping");
            if let Err(e) = self.sender.send(&PONG) {
                warn!(error = %e, "Failed to answer ping");
            }
        }
        next.run().await
    }
}

// ============================================================================
// ErrorBoundary
// ============================================================================

/// Callback invoked with every failure an [`ErrorBoundary`] recovers.
pub type ErrorCallback = Arc<dyn Fn(&Error, &Action) + Send + Sync>;

/// Recovers failures from downstream middleware and handlers.
///
/// Place it first to cover the whole chain. Invariant violations are always
/// passed through.
#[derive(Clone, Default)]
pub struct ErrorBoundary {
    on_error: Option<ErrorCallback>,
}

impl fmt::Debug for ErrorBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorBoundary")
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl ErrorBoundary {
    /// Creates a boundary that only logs recovered failures.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a boundary that reports recovered failures to `on_error`.
    #[must_use]
    pub fn with_callback<F>(on_error: F) -> Self
    where
        F: Fn(&Error, &Action) + Send + Sync + 'static,
    {
        Self {
            on_error: Some(Arc::new(on_error)),
        }
    }
}

#[async_trait]
impl<S: StoreState> Middleware<S> for ErrorBoundary {
    async fn handle(&self, ctx: &MiddlewareContext<S>, next: Next<S>) -> Result<()> {
        match next.run().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_invariant_violation() => Err(e),
            Err(e) => {
                warn!(action = %ctx.action(), error = %e, "Dispatch failure recovered");
                if let Some(on_error) = &self.on_error {
                    on_error(&e, ctx.action());
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::events::EventBus;
    use crate::store::Store;

    fn failing_store() -> Store<i64> {
        let store = Store::new(0_i64, Arc::new(EventBus::new()));
        store.define_action("boom", |_: &i64, _| Err("kaput".into()));
        store.define_action("inc", |s: &i64, _| Ok(Some(s + 1)));
        store
    }

    #[test]
    fn test_is_ping() {
        assert!(PingPong::is_ping(&Action::new("message", Some(json!("ping")))));
        assert!(!PingPong::is_ping(&Action::new("message", Some(json!("pong")))));
        assert!(!PingPong::is_ping(&Action::new("message", Some(json!({ "ping": true })))));
        assert!(!PingPong::is_ping(&Action::new("open", Some(json!("ping")))));
    }

    #[tokio::test]
    async fn test_logger_is_transparent() {
        let store = failing_store();
        store.use_middleware(Logger);

        store.dispatch("inc", None).await.unwrap();
        assert_eq!(store.state(), 1);
        assert!(store.dispatch("boom", None).await.is_err());
    }

    #[tokio::test]
    async fn test_error_boundary_recovers_handler_failure() {
        let store = failing_store();
        let recovered = Arc::new(Mutex::new(Vec::new()));
        {
            let recovered = Arc::clone(&recovered);
            store.use_middleware(ErrorBoundary::with_callback(move |err, action| {
                recovered
                    .lock()
                    .push(format!("{}: {}", action.kind(), err));
            }));
        }

        store.dispatch("boom", None).await.unwrap();
        assert_eq!(
            *recovered.lock(),
            vec!["boom: Handler for `boom` failed: kaput"]
        );
    }

    #[tokio::test]
    async fn test_error_boundary_passes_invariant_violations() {
        let store = failing_store();
        store.use_middleware(ErrorBoundary::new());
        store.use_fn(|_ctx, next| async move {
            next.run().await?;
            next.run().await
        });

        let err = store.dispatch("inc", None).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_error_boundary_recovers_middleware_abort() {
        let store = failing_store();
        store.use_middleware(ErrorBoundary::new());
        store.use_fn(|_ctx, _next| async { Err(Error::middleware("rejected")) });

        store.dispatch("inc", None).await.unwrap();
        assert_eq!(store.state(), 0);
    }
}
