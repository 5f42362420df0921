//! In-process publish/subscribe.
//!
//! Every observable thing the client does is announced on one [`EventBus`]
//! per client instance. Payloads are [`serde_json::Value`]s.
//!
//! # Event Names
//!
//! | Name | Emitted by | Payload |
//! |------|------------|---------|
//! | `before:<event>` / `after:<event>` | state machine, every transition call | `null` |
//! | `connecting`, `connected`, `reconnecting`, `disconnected`, `closed` | state machine, on change | `null` |
//! | `stateChanged` | state machine, on change | `{ "from", "to" }` |
//! | `<action>` | store, when a handler changed state | new store state |
//! | `state-changed` | store, when a handler changed state | `{ "type", "state" }` |
//! | `error` | driver / store | `{ "message" }` (+ `"type"` for dispatch failures) |
//! | `evicted` | driver, queue overflow | the dropped payload |
//! | `reconnect-scheduled` | driver | `{ "attempt", "delayMs" }` |
//! | `reconnect-failed` | driver, attempts exhausted | `{ "attempts" }` |
//! | `idle` | driver, idle timeout | `{ "idleMs" }` |

// ============================================================================
// Submodules
// ============================================================================

/// Listener registry and emission.
pub mod bus;

// ============================================================================
// Re-exports
// ============================================================================

pub use bus::{EventBus, Listener, ListenerOutcome, Subscription};

// ============================================================================
// Event Names
// ============================================================================

/// Well-known event names.
pub mod names {
    /// Connection attempt started.
    pub const CONNECTING: &str = "connecting";
    /// Transport is open.
    pub const CONNECTED: &str = "connected";
    /// First attempt failed, recovery in progress.
    pub const RECONNECTING: &str = "reconnecting";
    /// Connection closed by explicit request.
    pub const DISCONNECTED: &str = "disconnected";
    /// Connection closed.
    pub const CLOSED: &str = "closed";
    /// Connection state transition.
    pub const STATE_CHANGED: &str = "stateChanged";
    /// Store state transition.
    pub const STORE_STATE_CHANGED: &str = "state-changed";
    /// Informational failure report.
    pub const ERROR: &str = "error";
    /// Queued message dropped on overflow.
    pub const EVICTED: &str = "evicted";
    /// Reattempt timer armed.
    pub const RECONNECT_SCHEDULED: &str = "reconnect-scheduled";
    /// Reattempts exhausted.
    pub const RECONNECT_FAILED: &str = "reconnect-failed";
    /// No traffic for the configured idle timeout.
    pub const IDLE: &str = "idle";

    /// Returns the `before:<event>` hook name.
    #[must_use]
    pub fn before(event: &str) -> String {
        format!("before:{event}")
    }

    /// Returns the `after:<event>` hook name.
    #[must_use]
    pub fn after(event: &str) -> String {
        format!("after:{event}")
    }
}
