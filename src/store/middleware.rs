//! Onion middleware.
//!
//! Middleware at index `i` receives a [`Next`] bound to index `i + 1`. The
//! handler phase sits behind the last middleware:
//!
//! ```text
//! dispatch ─► mw[0] ─► mw[1] ─► ... ─► handlers
//!             before   before          (state write)
//!             after ◄─ after ◄──────────┘
//! ```
//!
//! A middleware may do work before and after `next.run().await`, may await
//! anything in between, or may return early to abort the dispatch. Calling
//! `next.run()` a second time fails with
//! [`Error::InvariantViolation`] and fails the whole dispatch, even if the
//! middleware discards that error.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::error;

use crate::error::{Error, Result};
use crate::events::EventBus;

use super::action::Action;
use super::dispatcher::{Store, StoreState};

// ============================================================================
// Middleware
// ============================================================================

/// One layer of the dispatch pipeline.
#[async_trait]
pub trait Middleware<S: StoreState>: Send + Sync + 'static {
    /// Handles one dispatch. Call `next.run().await` exactly once to continue.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the dispatch unless an earlier middleware
    /// recovers it.
    async fn handle(&self, ctx: &MiddlewareContext<S>, next: Next<S>) -> Result<()>;
}

// ============================================================================
// FnMiddleware
// ============================================================================

/// Middleware from an async closure.
///
/// ```ignore
/// store.use_fn(|ctx, next| async move {
///     tracing::info!(action = %ctx.action(), "before");
///     next.run().await
/// });
/// ```
pub struct FnMiddleware<F>(F);

impl<F> FnMiddleware<F> {
    /// Wraps a closure.
    #[inline]
    #[must_use]
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<S, F, Fut> Middleware<S> for FnMiddleware<F>
where
    S: StoreState,
    F: Fn(MiddlewareContext<S>, Next<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &MiddlewareContext<S>, next: Next<S>) -> Result<()> {
        (self.0)(ctx.clone(), next).await
    }
}

// ============================================================================
// MiddlewareContext
// ============================================================================

/// Per-dispatch context shared read-only by every middleware.
#[derive(Clone)]
pub struct MiddlewareContext<S: StoreState> {
    /// The action being dispatched.
    action: Arc<Action>,
    /// Store state when the dispatch started.
    state: Arc<S>,
    /// Owning store.
    store: Store<S>,
}

impl<S: StoreState> MiddlewareContext<S> {
    pub(crate) fn new(action: Action, state: Arc<S>, store: Store<S>) -> Self {
        Self {
            action: Arc::new(action),
            state,
            store,
        }
    }

    /// The action being dispatched.
    #[inline]
    #[must_use]
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Store state snapshot taken when the dispatch started.
    #[inline]
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// The store's event bus.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        self.store.bus()
    }

    /// Dispatches another action through the full pipeline.
    ///
    /// # Errors
    ///
    /// Re-dispatching the action type currently being handled fails with
    /// [`Error::InvariantViolation`]. Other failures are those of
    /// [`Store::dispatch`].
    pub async fn dispatch(&self, kind: impl Into<String>, payload: Option<Value>) -> Result<()> {
        self.store.dispatch(kind, payload).await
    }

    pub(crate) fn store(&self) -> &Store<S> {
        &self.store
    }
}

// ============================================================================
// ChainRun
// ============================================================================

/// State of one pass through the chain.
pub(crate) struct ChainRun<S: StoreState> {
    chain: Vec<Arc<dyn Middleware<S>>>,
    ctx: MiddlewareContext<S>,
    /// Set when a middleware called `next` twice.
    violation: Mutex<Option<String>>,
}

impl<S: StoreState> ChainRun<S> {
    pub(crate) fn new(chain: Vec<Arc<dyn Middleware<S>>>, ctx: MiddlewareContext<S>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            ctx,
            violation: Mutex::new(None),
        })
    }

    /// Runs middleware `index`, or the handler phase past the end.
    pub(crate) fn step(self: Arc<Self>, index: usize) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match self.chain.get(index) {
                Some(middleware) => {
                    let middleware = Arc::clone(middleware);
                    let next = Next::new(Arc::clone(&self), index + 1);
                    middleware.handle(&self.ctx, next).await
                }
                None => self.ctx.store().apply(self.ctx.action()),
            }
        })
    }

    /// Takes the recorded violation, if any.
    pub(crate) fn take_violation(&self) -> Option<Error> {
        self.violation.lock().take().map(Error::invariant_violation)
    }

    fn poison(&self, message: &str) {
        let mut violation = self.violation.lock();
        if violation.is_none() {
            *violation = Some(message.to_owned());
        }
    }
}

// ============================================================================
// Next
// ============================================================================

/// Continuation into the rest of the chain.
pub struct Next<S: StoreState> {
    run: Arc<ChainRun<S>>,
    index: usize,
    called: AtomicBool,
}

impl<S: StoreState> Next<S> {
    fn new(run: Arc<ChainRun<S>>, index: usize) -> Self {
        Self {
            run,
            index,
            called: AtomicBool::new(false),
        }
    }

    /// Runs the downstream middleware and handlers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] on a second call, otherwise
    /// whatever downstream returned.
    pub async fn run(&self) -> Result<()> {
        if self.called.swap(true, Ordering::AcqRel) {
            let message = format!(
                "next() called more than once by middleware {} while dispatching `{}`",
                self.index - 1,
                self.run.ctx.action().kind()
            );
            error!(action = %self.run.ctx.action(), middleware = self.index - 1, "{message}");
            self.run.poison(&message);
            return Err(Error::invariant_violation(message));
        }

        Arc::clone(&self.run).step(self.index).await
    }

    /// Returns `true` once `run` has been called.
    #[inline]
    #[must_use]
    pub fn is_called(&self) -> bool {
        self.called.load(Ordering::Acquire)
    }
}
