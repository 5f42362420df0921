//! Connection lifecycle state machine.
//!
//! # Transition Table
//!
//! | Current | Event | Next | Side-effect event |
//! |---|---|---|---|
//! | Idle | connecting | Connecting | `connecting` |
//! | Connecting | connected | Connected | `connected` |
//! | Connecting | close | Reconnecting | `reconnecting` |
//! | Connected | disconnect | Closed | `disconnected` |
//! | Connected | close | Closed | `closed` |
//! | Reconnecting | connected | Connected | `connected` |
//! | Reconnecting | close | Closed | `closed` |
//! | Closed | connecting | Connecting | `connecting` |
//!
//! Any other pair leaves the state unchanged.
//!
//! # Emission Order
//!
//! Every [`StateMachine::transition`] call emits, in this order:
//!
//! 1. `before:<event>`
//! 2. the side-effect event (only on change)
//! 3. `stateChanged { from, to }` (only on change)
//! 4. `after:<event>`
//!
//! The new state is stored before step 2.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::events::{EventBus, names};

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of one client's connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Attempt in progress.
    Connecting,
    /// Transport open.
    Connected,
    /// First attempt failed, recovery in progress.
    Reconnecting,
    /// Closed, either by request or after recovery gave up.
    Closed,
}

impl ConnectionState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Idle,
        Self::Connecting,
        Self::Connected,
        Self::Reconnecting,
        Self::Closed,
    ];

    /// Returns the state name as serialized.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Closed => "CLOSED",
        }
    }

    /// Looks up the transition table.
    ///
    /// Returns the next state and the side-effect event name, or `None` if
    /// `event` is not legal in this state.
    #[must_use]
    pub const fn next(self, event: LifecycleEvent) -> Option<(Self, &'static str)> {
        use LifecycleEvent as E;

        match (self, event) {
            (Self::Idle, E::Connecting) => Some((Self::Connecting, names::CONNECTING)),
            (Self::Connecting, E::Connected) => Some((Self::Connected, names::CONNECTED)),
            (Self::Connecting, E::Close) => Some((Self::Reconnecting, names::RECONNECTING)),
            (Self::Connected, E::Disconnect) => Some((Self::Closed, names::DISCONNECTED)),
            (Self::Connected, E::Close) => Some((Self::Closed, names::CLOSED)),
            (Self::Reconnecting, E::Connected) => Some((Self::Connected, names::CONNECTED)),
            (Self::Reconnecting, E::Close) => Some((Self::Closed, names::CLOSED)),
            (Self::Closed, E::Connecting) => Some((Self::Connecting, names::CONNECTING)),
            _ => None,
        }
    }

    /// Returns `true` while an attempt is in flight or the transport is open.
    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LifecycleEvent
// ============================================================================

/// Input to [`StateMachine::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// An attempt is starting.
    Connecting,
    /// The transport opened.
    Connected,
    /// The transport closed or an attempt failed.
    Close,
    /// A scheduled reattempt came due. Never changes state.
    Retry,
    /// The caller asked to disconnect.
    Disconnect,
}

impl LifecycleEvent {
    /// Every event, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Connecting,
        Self::Connected,
        Self::Close,
        Self::Retry,
        Self::Disconnect,
    ];

    /// Returns the event name used in `before:`/`after:` hooks.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Close => "close",
            Self::Retry => "retry",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// StateMachine
// ============================================================================

/// Holds the current [`ConnectionState`] and announces transitions.
///
/// Transitions are only driven by the connection driver task, so calls
/// never interleave.
#[derive(Debug)]
pub struct StateMachine {
    /// Current state; receivers observe every change.
    state: watch::Sender<ConnectionState>,
    /// Bus the transition events go to.
    bus: Arc<EventBus>,
}

impl StateMachine {
    /// Creates a machine in [`ConnectionState::Idle`].
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self { state, bus }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Applies `event` and returns the resulting state.
    pub fn transition(&self, event: LifecycleEvent) -> ConnectionState {
        let name = event.as_str();
        self.bus.emit(&names::before(name), &Value::Null);

        let current = self.state();
        let resulting = match current.next(event) {
            Some((next, side_effect)) => {
                self.state.send_replace(next);
                debug!(from = %current, to = %next, event = name, "Connection state changed");

                self.bus.emit(side_effect, &Value::Null);
                self.bus
                    .emit(names::STATE_CHANGED, &json!({ "from": current, "to": next }));
                next
            }
            None => {
                trace!(state = %current, event = name, "Transition ignored");
                current
            }
        };

        self.bus.emit(&names::after(name), &Value::Null);
        resulting
    }
}

// ============================================================================
// Tests
// ============================================================================
