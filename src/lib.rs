//! Resilient WebSocket client.
//!
//! Wraps a WebSocket connection with automatic recovery and a
//! middleware-driven action store.
//!
//! # Architecture
//!
//! Each [`Client`] owns one driver task. The task holds the transport
//! handle and reacts to commands from client handles, transport
//! notifications and reattempt timers, one at a time:
//!
//! - **Lifecycle**: `IDLE → CONNECTING → CONNECTED`, with `RECONNECTING`
//!   and `CLOSED` for recovery and shutdown
//! - **Recovery**: unclean closes are retried with exponential backoff
//!   (1s, 2s, 4s, ...) until the attempt limit
//! - **Queue**: messages sent while disconnected are kept in a bounded
//!   FIFO and flushed in order on the next open
//! - **Store**: inbound messages and connection changes become actions
//!   that flow through middleware into state handlers
//!
//! # Quick Start
//!
//! ```no_run
//! use resilient_ws::{Client, Logger, Result, events::names};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder("wss://echo.example.com/ws")
//!         .max_reconnect_attempts(5)
//!         .build()?;
//!
//!     client.use_middleware(Logger);
//!     let _sub = client.on(names::STORE_STATE_CHANGED, |change| {
//!         println!("{change}");
//!     });
//!
//!     client.send(&serde_json::json!({ "type": "subscribe", "topic": "prices" }))?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     client.close().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`], [`ClientBuilder`], [`ClientOptions`] |
//! | [`connection`] | State machine, backoff, outbound queue |
//! | [`store`] | [`Store`], [`Middleware`], built-in middleware |
//! | [`events`] | [`EventBus`] and event names |
//! | [`transport`] | [`Transport`] capability, WebSocket and in-memory |
//! | [`protocol`] | Close codes and payload codec |
//! | [`auth`] | Token providers |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Token acquisition for authenticated connections.
pub mod auth;

/// Client handle, builder and options.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Connection resilience primitives.
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// In-process publish/subscribe.
pub mod events;

/// Type-safe identifiers.
pub mod identifiers;

/// Close codes and payload encoding.
pub mod protocol;

/// Middleware-chained action store.
pub mod store;

/// Transport capability and implementations.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, ClientBuilder, ClientOptions, ClientSender};

// Auth types
pub use auth::{StaticToken, TokenProvider};

// Connection types
pub use connection::{Backoff, ConnectionState, MessageQueue};

// Error types
pub use error::{Error, Result};

// Event types
pub use events::{EventBus, Subscription};

// Identifier types
pub use identifiers::{ClientId, ListenerId};

// Protocol types
pub use protocol::{CloseInfo, JsonCodec, PayloadCodec};

// Store types
pub use store::{
    Action, ClientState, ErrorBoundary, Logger, Middleware, MiddlewareContext, Next, PingPong,
    Store, StoreState,
};

// Transport types
pub use transport::{MemoryTransport, Transport, TransportEvents, TransportHandle, WebSocketTransport};
