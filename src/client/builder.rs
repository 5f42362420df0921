//! Builder pattern for client configuration.
//!
//! # Example
//!
//! ```ignore
//! use resilient_ws::{Client, StaticToken};
//!
//! let client = Client::builder("wss://api.example.com/ws")
//!     .max_reconnect_attempts(3)
//!     .token_provider(StaticToken::new("secret"))
//!     .build()?;
//! ```
//!
//! A custom store state replaces [`ClientState`]; its handlers for the
//! `open`, `close` and `message` actions are then up to the caller:
//!
//! ```ignore
//! let client = Client::builder("ws://localhost:9000")
//!     .with_state(0_u64)
//!     .build()?;
//! client.define_action("message", |count, _| Ok(Some(count + 1)));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, debug_span};

use crate::auth::TokenProvider;
use crate::connection::{Reconnector, StateMachine};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::identifiers::ClientId;
use crate::protocol::{JsonCodec, PayloadCodec};
use crate::store::{ClientState, Store, StoreState};
use crate::transport::{Transport, WebSocketTransport};

use super::core::Client;
use super::driver::{ConnectionDriver, DriverParts, Shared};
use super::options::ClientOptions;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`].
///
/// Use [`Client::builder()`] to create one.
pub struct ClientBuilder<S: StoreState = ClientState> {
    /// Connection and recovery settings.
    options: ClientOptions,
    /// Connection factory; WebSocket unless overridden.
    transport: Option<Arc<dyn Transport>>,
    /// Token source for authenticated connections.
    auth: Option<Arc<dyn TokenProvider>>,
    /// Payload encoding.
    codec: Arc<dyn PayloadCodec>,
    /// Initial store state.
    state: S,
    /// Registers default handlers on the new store.
    setup: Option<fn(&Store<S>)>,
}

impl<S: StoreState + fmt::Debug> fmt::Debug for ClientBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("options", &self.options)
            .field("custom_transport", &self.transport.is_some())
            .field("auth", &self.auth.is_some())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientBuilder<ClientState> {
    /// Creates a builder for `url` with default options.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_options(ClientOptions::new(url))
    }

    /// Creates a builder from prepared options.
    #[must_use]
    pub fn from_options(options: ClientOptions) -> Self {
        Self {
            options,
            transport: None,
            auth: None,
            codec: Arc::new(JsonCodec),
            state: ClientState::default(),
            setup: Some(ClientState::register),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl<S: StoreState> ClientBuilder<S> {
    /// Replaces all options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the attempt limit, counting the initial connection.
    #[inline]
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.options.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the outbound queue capacity.
    #[inline]
    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.options.max_queue_size = size;
        self
    }

    /// Enables `idle` events after `timeout` without traffic.
    #[inline]
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_idle_timeout(timeout);
        self
    }

    /// Sets whether `build()` starts connecting immediately.
    #[inline]
    #[must_use]
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.options.auto_connect = auto_connect;
        self
    }

    /// Sets the delay before the first reattempt.
    #[inline]
    #[must_use]
    pub fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.options = self.options.with_reconnect_base_delay(delay);
        self
    }

    /// Uses a custom transport instead of WebSocket.
    #[inline]
    #[must_use]
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Acquires a token before every connection attempt.
    #[inline]
    #[must_use]
    pub fn token_provider<P: TokenProvider>(mut self, provider: P) -> Self {
        self.auth = Some(Arc::new(provider));
        self
    }

    /// Uses a custom payload codec instead of JSON.
    #[inline]
    #[must_use]
    pub fn codec<C: PayloadCodec>(mut self, codec: C) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Replaces the store state. No default handlers are registered for it.
    #[must_use]
    pub fn with_state<T: StoreState>(self, state: T) -> ClientBuilder<T> {
        ClientBuilder {
            options: self.options,
            transport: self.transport,
            auth: self.auth,
            codec: self.codec,
            state,
            setup: None,
        }
    }

    /// Builds the client and starts its driver task.
    ///
    /// Connects right away unless `auto_connect` is off.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] or [`Error::Config`] if the options are invalid
    /// - [`Error::Config`] if called outside a tokio runtime
    pub fn build(self) -> Result<Client<S>> {
        let url = self.options.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            Error::config(
                "Client must be built inside a tokio runtime.\n\
                 Example: call build() from within #[tokio::main]",
            )
        })?;

        let id = ClientId::new();
        let bus = Arc::new(EventBus::new());
        let machine = Arc::new(StateMachine::new(Arc::clone(&bus)));
        let store = Store::new(self.state, Arc::clone(&bus));
        if let Some(setup) = self.setup {
            setup(&store);
        }
        let shared = Arc::new(Shared::new(self.options.max_queue_size));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (token_tx, token_rx) = mpsc::unbounded_channel();

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));

        let driver = ConnectionDriver::new(DriverParts {
            url,
            idle_timeout: self.options.idle_timeout(),
            transport,
            auth: self.auth,
            codec: self.codec,
            machine: Arc::clone(&machine),
            store: store.clone(),
            bus: Arc::clone(&bus),
            shared: Arc::clone(&shared),
            reconnector: Reconnector::new(self.options.backoff(), tick_tx),
            events: event_tx,
            tokens: token_tx,
        });

        let span = debug_span!("client", id = %id);
        runtime.spawn(
            driver
                .run(command_rx, event_rx, tick_rx, token_rx)
                .instrument(span),
        );
        debug!(client = %id, url = %self.options.url, "Client built");

        let client = Client::from_parts(id, self.options, command_tx, machine, store, bus, shared);
        if client.options().auto_connect {
            client.connect()?;
        }
        Ok(client)
    }
}

// ============================================================================
// Tests
// ============================================================================
