//! Error types for resilient-ws.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use resilient_ws::{Client, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     client.send(&"hello")?;
//!     client.dispatch("refresh", None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Reaches callers? |
//! |----------|----------|------------------|
//! | Configuration | [`Error::Config`] | yes, from `build()` |
//! | Connection | [`Error::Transport`], [`Error::Auth`], [`Error::ConnectionClosed`] | no, surfaced as `error` events |
//! | Dispatch | [`Error::Handler`], [`Error::Middleware`], [`Error::InvariantViolation`] | yes, from `dispatch()` |
//! | Lifecycle | [`Error::ClientShutdown`] | yes |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::Url`] | yes |
//!
//! Queue overflow is not an error; evictions are announced through the
//! `evicted` event.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

/// Boxed error returned by action handlers.
///
/// Handlers can fail with any error type; the store wraps it into
/// [`Error::Handler`] together with the action name.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client options are invalid or the client is built
    /// outside a tokio runtime.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport could not be opened or written to.
    ///
    /// Absorbed by the reconnector; applications only see it as an
    /// `error` event.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Token acquisition failed.
    ///
    /// Aborts the current connection attempt. The next `connect()` retries.
    #[error("Auth error: {message}")]
    Auth {
        /// Description of the auth failure.
        message: String,
    },

    /// The transport handle is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// An action handler failed.
    ///
    /// Writes made by earlier handlers in the same dispatch are kept.
    #[error("Handler for `{action}` failed: {message}")]
    Handler {
        /// The action being dispatched.
        action: String,
        /// Error message produced by the handler.
        message: String,
    },

    /// A middleware aborted the dispatch.
    #[error("Middleware error: {message}")]
    Middleware {
        /// Description of the middleware failure.
        message: String,
    },

    /// A dispatch pipeline invariant was broken.
    ///
    /// Raised when a middleware calls `next()` twice or an action is
    /// re-dispatched from inside its own pipeline. Always fatal to the
    /// dispatch.
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The client's driver task has stopped.
    #[error("Client has shut down")]
    ClientShutdown,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// URL parse error.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an auth error.
    #[inline]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Creates a handler error for the given action.
    #[inline]
    pub fn handler(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Creates a middleware error.
    #[inline]
    pub fn middleware(message: impl Into<String>) -> Self {
        Self::Middleware {
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    #[inline]
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a transport-level error.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ConnectionClosed | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is an invariant violation.
    #[inline]
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }

    /// Returns `true` if this is a dispatch pipeline error.
    #[inline]
    #[must_use]
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            Self::Handler { .. } | Self::Middleware { .. } | Self::InvariantViolation { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on a later connection attempt.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Auth { .. } | Self::ConnectionClosed | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::transport("connection refused");
        assert_eq!(err.to_string(), "Transport error: connection refused");
    }

    #[test]
    fn test_handler_error_display() {
        let err = Error::handler("message", "bad payload");
        assert_eq!(err.to_string(), "Handler for `message` failed: bad payload");
    }

    #[test]
    fn test_is_transport_error() {
        assert!(Error::transport("x").is_transport_error());
        assert!(Error::ConnectionClosed.is_transport_error());
        assert!(!Error::auth("x").is_transport_error());
    }

    #[test]
    fn test_is_invariant_violation() {
        let err = Error::invariant_violation("next() called twice");
        assert!(err.is_invariant_violation());
        assert!(err.is_dispatch_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::auth("expired").is_recoverable());
        assert!(Error::transport("reset").is_recoverable());
        assert!(!Error::config("bad url").is_recoverable());
        assert!(!Error::handler("x", "y").is_recoverable());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_from_url_error() {
        let url_err = url::Url::parse("not a url").unwrap_err();
        let err: Error = url_err.into();
        assert!(matches!(err, Error::Url(_)));
    }
}
