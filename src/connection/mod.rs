//! Connection resilience primitives.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `state` | Lifecycle state machine and its transition table |
//! | `reconnect` | Exponential backoff and the reattempt timer |
//! | `queue` | Bounded outbound queue with ordered flush |
//!
//! These pieces hold no transport of their own; the client's driver task
//! wires them to one.

// ============================================================================
// Submodules
// ============================================================================

/// Bounded outbound message queue.
pub mod queue;

/// Reconnection backoff policy and timer.
pub mod reconnect;

/// Connection lifecycle state machine.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use queue::{DEFAULT_MAX_QUEUE_SIZE, FlushReport, MessageQueue, QueuedMessage};
pub use reconnect::{
    Backoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_RECONNECT_ATTEMPTS, Reconnector, RetryDecision,
};
pub use state::{ConnectionState, LifecycleEvent, StateMachine};
