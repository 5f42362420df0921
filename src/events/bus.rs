//! Listener registry and synchronous emission.
//!
//! # Guarantees
//!
//! - Listeners for one name run in registration order.
//! - A failing listener is logged and skipped; siblings still run and the
//!   emitter never sees the failure. Panics count as failures.
//! - The listener list is snapshotted before invocation, so listeners may
//!   subscribe or unsubscribe while an emission is in progress.
//!
//! # Example
//!
//! ```
//! use resilient_ws::EventBus;
//! use serde_json::json;
//!
//! let bus = EventBus::new();
//! let id = bus.on("greeting", |payload| println!("got {payload}"));
//! bus.emit("greeting", &json!("hello"));
//! assert!(bus.off("greeting", id));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{trace, warn};

use crate::identifiers::ListenerId;

// ============================================================================
// Types
// ============================================================================

/// A registered event listener.
pub type Listener = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Return types accepted from listener closures.
///
/// Implemented for `()` (infallible listeners) and for any
/// `Result<(), E>` whose error is displayable.
pub trait ListenerOutcome {
    /// Converts the listener's return value into a uniform outcome.
    fn into_outcome(self) -> Result<(), String>;
}

impl ListenerOutcome for () {
    #[inline]
    fn into_outcome(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> ListenerOutcome for Result<(), E> {
    #[inline]
    fn into_outcome(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Publish/subscribe registry keyed by event name.
#[derive(Default)]
pub struct EventBus {
    /// Listeners per event name, in registration order.
    listeners: RwLock<FxHashMap<String, Vec<(ListenerId, Listener)>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("EventBus")
            .field("events", &listeners.len())
            .field(
                "listeners",
                &listeners.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `event`.
    ///
    /// Returns the id needed to remove it again with [`EventBus::off`].
    pub fn on<F, R>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) -> R + Send + Sync + 'static,
        R: ListenerOutcome,
    {
        let id = ListenerId::next();
        let listener: Listener = Arc::new(move |payload| listener(payload).into_outcome());
        let event = event.into();

        trace!(event = %event, %id, "Listener registered");

        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push((id, listener));
        id
    }

    /// Registers a listener and returns a [`Subscription`] handle for it.
    pub fn subscribe<F, R>(self: &Arc<Self>, event: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Value) -> R + Send + Sync + 'static,
        R: ListenerOutcome,
    {
        let event = event.into();
        let id = self.on(event.clone(), listener);
        Subscription {
            bus: Arc::downgrade(self),
            event,
            id,
        }
    }

    /// Removes a listener.
    ///
    /// Returns `false` if it was not registered; that is not an error.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;

        if entries.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Invokes every listener registered for `event`, in order.
    ///
    /// Returns the number of listeners that failed. Failures are logged
    /// and never interrupt the remaining listeners.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        let snapshot: Vec<(ListenerId, Listener)> = match self.listeners.read().get(event) {
            Some(entries) => entries.clone(),
            None => return 0,
        };

        let mut failed = 0;
        for (id, listener) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(payload)))
                .unwrap_or_else(|panic| Err(panic_message(panic.as_ref())));

            if let Err(message) = outcome {
                failed += 1;
                warn!(event, %id, error = %message, "Event listener failed");
            }
        }
        failed
    }

    /// Returns the number of listeners registered for `event`.
    #[inline]
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Removes every listener for every event.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

/// Extracts the message from a caught panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_owned()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle to one registered listener.
///
/// Dropping the handle does not unsubscribe; call
/// [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<EventBus>,
    event: String,
    id: ListenerId,
}

impl Subscription {
    /// The event name this subscription listens to.
    #[inline]
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// The listener id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.off(&self.event, self.id))
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

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_emit_runs_listeners_in_registration_order() {
        let bus = EventBus::new();
        let log = log();

        for name in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            bus.on("tick", move |_| log.lock().push(name.to_string()));
        }

        bus.emit("tick", &Value::Null);
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_emit_only_reaches_matching_event() {
        let bus = EventBus::new();
        let log = log();

        let tick_log = Arc::clone(&log);
        bus.on("tick", move |p| tick_log.lock().push(format!("tick {p}")));
        let tock_log = Arc::clone(&log);
        bus.on("tock", move |p| tock_log.lock().push(format!("tock {p}")));

        bus.emit("tick", &json!(1));
        assert_eq!(*log.lock(), vec!["tick 1"]);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::new();
        let log = log();
        let log_clone = Arc::clone(&log);
        let id = bus.on("x", move |_| log_clone.lock().push("called".into()));

        assert!(bus.off("x", id));
        bus.emit("x", &Value::Null);

        assert!(log.lock().is_empty());
        assert_eq!(bus.listener_count("x"), 0);
    }

    #[test]
    fn test_off_unknown_listener_is_noop() {
        let bus = EventBus::new();
        let id = bus.on("x", |_| ());

        assert!(!bus.off("y", id));
        assert!(!bus.off("x", ListenerId::next()));
        assert_eq!(bus.listener_count("x"), 1);
    }

    #[test]
    fn test_failing_listener_does_not_stop_siblings() {
        let bus = EventBus::new();
        let log = log();

        let before = Arc::clone(&log);
        bus.on("x", move |_| before.lock().push("before".into()));
        bus.on("x", |_| Err::<(), _>("listener exploded"));
        let after = Arc::clone(&log);
        bus.on("x", move |_| after.lock().push("after".into()));

        let failed = bus.emit("x", &Value::Null);

        assert_eq!(failed, 1);
        assert_eq!(*log.lock(), vec!["before", "after"]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_siblings() {
        let bus = EventBus::new();
        let log = log();

        let before = Arc::clone(&log);
        bus.on("tick", move |_| before.lock().push("before".to_string()));
        bus.on("tick", |_| -> () { panic!("listener exploded") });
        let after = Arc::clone(&log);
        bus.on("tick", move |_| after.lock().push("after".to_string()));

        assert_eq!(bus.emit("tick", &Value::Null), 1);
        assert_eq!(*log.lock(), vec!["before", "after"]);

        // the bus stays usable after a panic
        assert_eq!(bus.emit("tick", &Value::Null), 1);
        assert_eq!(log.lock().len(), 4);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"boom"), "panicked: boom");
        assert_eq!(panic_message(&String::from("bang")), "panicked: bang");
        assert_eq!(panic_message(&42_u8), "panicked");
    }

    #[test]
    fn test_listener_may_unsubscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(Mutex::new(0));

        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let bus_clone = Arc::clone(&bus);
        let slot_clone = Arc::clone(&slot);
        let calls_clone = Arc::clone(&calls);
        let id = bus.on("once", move |_| {
            *calls_clone.lock() += 1;
            if let Some(id) = *slot_clone.lock() {
                bus_clone.off("once", id);
            }
        });
        *slot.lock() = Some(id);

        bus.emit("once", &Value::Null);
        bus.emit("once", &Value::Null);

        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_subscription_unsubscribe() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe("x", |_| ());

        assert_eq!(sub.event(), "x");
        assert_eq!(bus.listener_count("x"), 1);
        assert!(sub.clone().unsubscribe());
        assert!(!sub.unsubscribe());
        assert_eq!(bus.listener_count("x"), 0);
    }

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new();
        assert_eq!(bus.emit("nobody", &Value::Null), 0);
    }

    #[test]
    fn test_clear() {
        let bus = EventBus::new();
        bus.on("a", |_| ());
        bus.on("b", |_| ());
        bus.clear();
        assert_eq!(bus.listener_count("a"), 0);
        assert_eq!(bus.listener_count("b"), 0);
    }
}
