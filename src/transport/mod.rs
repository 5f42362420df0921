//! Transport capability consumed by the client.
//!
//! The driver never creates sockets itself. It asks a [`Transport`] to open
//! a connection and receives notifications through [`TransportEvents`]:
//!
//! ```text
//! ┌──────────────┐   open(url, events)   ┌─────────────────┐
//! │   Driver     │──────────────────────►│   Transport     │
//! │   task       │◄──────────────────────│  (socket task)  │
//! │              │  open / message /     │                 │
//! │              │  error / close        │                 │
//! │              │──────────────────────►│                 │
//! └──────────────┘  handle.send / close  └─────────────────┘
//! ```
//!
//! `open` returns immediately with a handle; the `open` notification follows
//! once the connection is usable. Failures after `open` returned are
//! reported as `error` and/or `close` notifications.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | `tokio-tungstenite` implementation |
//! | `memory` | In-process test double |

// ============================================================================
// Submodules
// ============================================================================

/// In-process transport for tests and demos.
pub mod memory;

/// WebSocket transport on tokio-tungstenite.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::mpsc;
use url::Url;

use crate::error::Result;
use crate::protocol::CloseInfo;

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

// ============================================================================
// Traits
// ============================================================================

/// Opens connections.
pub trait Transport: Send + Sync + 'static {
    /// Starts opening a connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`](crate::Error::Transport) if the address
    /// is invalid or unreachable before any I/O starts.
    fn open(&self, url: &Url, events: TransportEvents) -> Result<Box<dyn TransportHandle>>;
}

/// One live connection.
pub trait TransportHandle: Send + Sync {
    /// Writes a raw frame, best effort.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection can no longer accept frames.
    fn send(&self, raw: &str) -> Result<()>;

    /// Starts a closing handshake.
    fn close(&self, code: u16, reason: &str);
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Notification from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is usable.
    Open,
    /// A frame arrived.
    Message(String),
    /// Something went wrong. Informational; a `Close` follows if the
    /// connection is lost.
    Error(String),
    /// The connection is gone. Last notification for a handle.
    Close(CloseInfo),
}

/// A notification stamped with the connection generation it belongs to.
#[derive(Debug)]
pub(crate) struct StampedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

// ============================================================================
// TransportEvents
// ============================================================================

/// Notification sink handed to [`Transport::open`].
///
/// Each sink is bound to one connection generation. Once the driver has
/// detached that connection, its notifications are ignored.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<StampedEvent>,
}

impl TransportEvents {
    /// Creates a sink for one connection generation.
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<StampedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Reports that the connection is usable.
    pub fn open(&self) {
        self.notify(TransportEvent::Open);
    }

    /// Reports an inbound frame.
    pub fn message(&self, raw: impl Into<String>) {
        self.notify(TransportEvent::Message(raw.into()));
    }

    /// Reports an error.
    pub fn error(&self, info: impl Into<String>) {
        self.notify(TransportEvent::Error(info.into()));
    }

    /// Reports that the connection is gone.
    pub fn close(&self, close: CloseInfo) {
        self.notify(TransportEvent::Close(close));
    }

    /// Returns `true` once the client has stopped listening.
    #[inline]
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }

    fn notify(&self, event: TransportEvent) {
        let _ = self.tx.send(StampedEvent {
            generation: self.generation,
            event,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
