//! Default store state and the actions the driver dispatches.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dispatcher::Store;

// ============================================================================
// Constants
// ============================================================================

/// Most recent messages kept in [`ClientState::messages`].
pub const MAX_MESSAGE_HISTORY: usize = 256;

/// Actions dispatched by the connection driver.
///
/// | Action | When | Payload |
/// |--------|------|---------|
/// | `open` | transport opened | none |
/// | `close` | transport closed | `{ "code", "reason", "wasClean" }` |
/// | `message` | frame received | decoded frame |
pub mod actions {
    /// Transport opened.
    pub const OPEN: &str = "open";
    /// Transport closed.
    pub const CLOSE: &str = "close";
    /// Frame received.
    pub const MESSAGE: &str = "message";
}

// ============================================================================
// ClientState
// ============================================================================

/// State held by a client's store unless a custom one is supplied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    /// Received payloads, oldest first.
    pub messages: Vec<Value>,
    /// Messages received since the client was built, including those no
    /// longer in `messages`.
    #[serde(default)]
    pub received: u64,
    /// Whether the transport is open.
    pub connected: bool,
}

impl ClientState {
    /// Registers handlers for the driver's actions.
    pub fn register(store: &Store<Self>) {
        store.define_action(actions::OPEN, |state: &Self, _| {
            Ok((!state.connected).then(|| Self {
                connected: true,
                ..state.clone()
            }))
        });

        store.define_action(actions::CLOSE, |state: &Self, _| {
            Ok(state.connected.then(|| Self {
                connected: false,
                ..state.clone()
            }))
        });

        store.define_action(actions::MESSAGE, |state: &Self, payload| {
            let mut next = state.clone();
            next.received = next.received.saturating_add(1);
            next.messages.push(payload.cloned().unwrap_or(Value::Null));
            if next.messages.len() > MAX_MESSAGE_HISTORY {
                let excess = next.messages.len() - MAX_MESSAGE_HISTORY;
                next.messages.drain(..excess);
            }
            Ok(Some(next))
        });
    }

    /// Most recently received payload.
    #[inline]
    #[must_use]
    pub fn last_message(&self) -> Option<&Value> {
        self.messages.last()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use serde_json::json;

    use crate::events::EventBus;

    fn store() -> Store<ClientState> {
        let store = Store::new(ClientState::default(), Arc::new(EventBus::new()));
        ClientState::register(&store);
        store
    }

    #[tokio::test]
    async fn test_open_and_close_toggle_connected() {
        let store = store();
        store.dispatch(actions::OPEN, None).await.unwrap();
        assert!(store.state().connected);

        store
            .dispatch(actions::CLOSE, Some(json!({ "code": 1006 })))
            .await
            .unwrap();
        assert!(!store.state().connected);
    }

    #[tokio::test]
    async fn test_messages_are_appended() {
        let store = store();
        store
            .dispatch(actions::MESSAGE, Some(json!({ "data": "test message" })))
            .await
            .unwrap();
        store.dispatch(actions::MESSAGE, Some(json!("ping"))).await.unwrap();

        let state = store.state();
        assert_eq!(state.messages, vec![json!({ "data": "test message" }), json!("ping")]);
        assert_eq!(state.last_message(), Some(&json!("ping")));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = store();
        for n in 0..(MAX_MESSAGE_HISTORY + 5) {
            store.dispatch(actions::MESSAGE, Some(json!(n))).await.unwrap();
        }

        let state = store.state();
        assert_eq!(state.messages.len(), MAX_MESSAGE_HISTORY);
        assert_eq!(state.messages[0], json!(5));
        assert_eq!(state.received, (MAX_MESSAGE_HISTORY + 5) as u64);
    }

    #[tokio::test]
    async fn test_full_history_of_repeats_still_announces() {
        let store = store();
        for _ in 0..MAX_MESSAGE_HISTORY {
            store.dispatch(actions::MESSAGE, Some(json!("tick"))).await.unwrap();
        }

        let announced = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let announced = Arc::clone(&announced);
            store.bus().on(actions::MESSAGE, move |state: &Value| {
                announced.lock().push(state["received"].clone());
            });
        }

        store.dispatch(actions::MESSAGE, Some(json!("tick"))).await.unwrap();
        assert_eq!(*announced.lock(), vec![json!(MAX_MESSAGE_HISTORY + 1)]);
        assert_eq!(store.state().messages.len(), MAX_MESSAGE_HISTORY);
    }

    #[tokio::test]
    async fn test_repeated_open_does_not_announce() {
        let store = store();
        let changes = Arc::new(parking_lot::Mutex::new(0));
        {
            let changes = Arc::clone(&changes);
            store.bus().on(crate::events::names::STORE_STATE_CHANGED, move |_: &Value| {
                *changes.lock() += 1;
            });
        }

        store.dispatch(actions::OPEN, None).await.unwrap();
        store.dispatch(actions::OPEN, None).await.unwrap();
        assert_eq!(*changes.lock(), 1);
    }
}
