//! Client configuration.
//!
//! Options can be built fluently or read from JSON using the same camelCase
//! keys as other clients of this protocol:
//!
//! ```ignore
//! use resilient_ws::ClientOptions;
//!
//! let options = ClientOptions::new("wss://api.example.com/ws")
//!     .with_max_reconnect_attempts(3)
//!     .with_max_queue_size(50);
//!
//! let same = ClientOptions::from_json(
//!     r#"{ "url": "wss://api.example.com/ws", "maxReconnectAttempts": 3, "maxQueueSize": 50 }"#,
//! )?;
//! ```
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `url` | required | `ws://` or `wss://` address |
//! | `maxReconnectAttempts` | 5 | attempts counting the initial connection |
//! | `maxQueueSize` | 10 | messages kept while disconnected |
//! | `idleTimeout` | none | ms without traffic before an `idle` event |
//! | `autoConnect` | `true` | connect as soon as the client is built |
//! | `reconnectBaseDelay` | 1000 | ms before the first reattempt |

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::connection::{
    Backoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_RECONNECT_ATTEMPTS,
};
use crate::error::{Error, Result};

// ============================================================================
// ClientOptions
// ============================================================================

/// Connection and recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    /// Server address.
    pub url: String,

    /// Attempts allowed, counting the initial connection.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Outbound messages kept while disconnected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Milliseconds without traffic before an `idle` event.
    #[serde(rename = "idleTimeout", default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    /// Connect as soon as the client is built.
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,

    /// Milliseconds before the first reattempt; doubles on every failure.
    #[serde(rename = "reconnectBaseDelay", default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}

fn default_auto_connect() -> bool {
    true
}

fn default_reconnect_base_delay_ms() -> u64 {
    duration_ms(DEFAULT_BASE_DELAY)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientOptions {
    /// Creates options with defaults for everything but the address.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            idle_timeout_ms: None,
            auto_connect: true,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
        }
    }

    /// Parses options from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the document is malformed or lacks `url`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientOptions {
    /// Sets the attempt limit, counting the initial connection.
    #[inline]
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the outbound queue capacity.
    #[inline]
    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Enables `idle` events after `timeout` without traffic.
    #[inline]
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// Sets whether the client connects as soon as it is built.
    #[inline]
    #[must_use]
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Sets the delay before the first reattempt.
    #[inline]
    #[must_use]
    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay_ms = duration_ms(delay);
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl ClientOptions {
    /// Idle timeout, if enabled.
    #[inline]
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Delay before the first reattempt.
    #[inline]
    #[must_use]
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Backoff policy these options describe.
    #[inline]
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.max_reconnect_attempts, self.reconnect_base_delay())
    }

    /// Validates the options and returns the parsed address.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if the address does not parse
    /// - [`Error::Config`] if the scheme is not `ws`/`wss`, the queue
    ///   capacity is zero or the idle timeout is zero
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.url)?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Unsupported scheme `{}` in {}. Use ws:// or wss://",
                url.scheme(),
                self.url
            )));
        }

        if self.max_queue_size == 0 {
            return Err(Error::config("maxQueueSize must be at least 1"));
        }

        if self.idle_timeout_ms == Some(0) {
            return Err(Error::config("idleTimeout must be greater than zero"));
        }

        Ok(url)
    }
}

// ============================================================================
// Tests
// ============================================================================
