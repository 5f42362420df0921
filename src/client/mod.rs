//! Client entry point.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Handle to one resilient connection |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ClientOptions`] | Serializable connection settings |
//! | [`ClientSender`] | Send-only handle for middleware and listeners |
//!
//! # Example
//!
//! ```no_run
//! use resilient_ws::{Client, Result};
//!
//! # async fn example() -> Result<()> {
//! let client = Client::builder("wss://api.example.com/ws")
//!     .max_queue_size(50)
//!     .build()?;
//!
//! client.send(&serde_json::json!({ "type": "hello" }))?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Builder pattern for client configuration.
pub mod builder;

/// Client handle.
pub mod core;

/// Connection driver task.
pub(crate) mod driver;

/// Client options.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientBuilder;
pub use core::{Client, ClientSender};
pub use options::ClientOptions;
