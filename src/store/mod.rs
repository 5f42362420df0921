//! Middleware-chained action store.
//!
//! All application-visible state changes go through [`Store::dispatch`]:
//! the action passes through every middleware, then every handler
//! registered for its type, and the resulting state is announced on the
//! bus.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `action` | [`Action`] |
//! | `middleware` | [`Middleware`] trait, [`Next`], [`MiddlewareContext`] |
//! | `dispatcher` | [`Store`] |
//! | `builtin` | [`Logger`], [`PingPong`], [`ErrorBoundary`] |
//! | `client_state` | [`ClientState`] and the driver's actions |

// ============================================================================
// Submodules
// ============================================================================

/// Dispatched actions.
pub mod action;

/// Ready-made middleware.
pub mod builtin;

/// Default store state.
pub mod client_state;

/// The store itself.
pub mod dispatcher;

/// Middleware trait and chain plumbing.
pub mod middleware;

// ============================================================================
// Re-exports
// ============================================================================

pub use action::Action;
pub use builtin::{ErrorBoundary, ErrorCallback, Logger, PING, PONG, PingPong};
pub use client_state::{ClientState, MAX_MESSAGE_HISTORY, actions};
pub use dispatcher::{Handler, Store, StoreState};
pub use middleware::{FnMiddleware, Middleware, MiddlewareContext, Next};
