//! Client handle.
//!
//! A [`Client`] is a cheap, cloneable handle to one connection. All
//! connection work happens on the driver task it spawned; the handle only
//! sends commands and reads snapshots.
//!
//! # Example
//!
//! ```ignore
//! use resilient_ws::{Client, Logger, events::names};
//!
//! let client = Client::builder("wss://api.example.com/ws").build()?;
//! client.use_middleware(Logger);
//!
//! let _sub = client.on(names::STORE_STATE_CHANGED, |change| {
//!     println!("{change}");
//! });
//!
//! client.send(&serde_json::json!({ "type": "subscribe", "topic": "prices" }))?;
//! client.close().await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::{ConnectionState, StateMachine};
use crate::error::{BoxError, Error, Result};
use crate::events::{EventBus, ListenerOutcome, Subscription};
use crate::identifiers::{ClientId, ListenerId};
use crate::store::{ClientState, Middleware, MiddlewareContext, Next, Store, StoreState};

use super::builder::ClientBuilder;
use super::driver::{Command, Shared};
use super::options::ClientOptions;

// ============================================================================
// ClientInner
// ============================================================================

/// State shared by every handle of one client.
struct ClientInner<S: StoreState> {
    id: ClientId,
    options: ClientOptions,
    commands: mpsc::UnboundedSender<Command>,
    machine: Arc<StateMachine>,
    store: Store<S>,
    bus: Arc<EventBus>,
    shared: Arc<Shared>,
}

// ============================================================================
// Client
// ============================================================================

/// Handle to a resilient connection.
///
/// Dropping the last handle stops the driver task and closes the transport.
pub struct Client<S: StoreState = ClientState> {
    inner: Arc<ClientInner<S>>,
}

impl<S: StoreState> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StoreState> fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("url", &self.inner.options.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client<ClientState> {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientBuilder<ClientState> {
        ClientBuilder::new(url)
    }
}

// ============================================================================
// Client - Connection
// ============================================================================

impl<S: StoreState> Client<S> {
    pub(crate) fn from_parts(
        id: ClientId,
        options: ClientOptions,
        commands: mpsc::UnboundedSender<Command>,
        machine: Arc<StateMachine>,
        store: Store<S>,
        bus: Arc<EventBus>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id,
                options,
                commands,
                machine,
                store,
                bus,
                shared,
            }),
        }
    }

    /// Starts connecting. No-op while a connection is live or a reattempt
    /// is pending. Resets the attempt counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientShutdown`] if the driver task has stopped.
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Closes the connection with code 1000 and cancels any pending
    /// reattempt. Resolves once the driver has torn everything down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientShutdown`] if the driver task has stopped.
    pub async fn close(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Close(ack))?;
        done.await.map_err(|_| Error::ClientShutdown)
    }

    /// Sends a payload now if connected, or queues it until the next
    /// connection.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the payload does not serialize
    /// - [`Error::ClientShutdown`] if the driver task has stopped
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.command(Command::Send(value))
    }

    /// Returns a send-only handle that does not keep the client alive.
    #[inline]
    #[must_use]
    pub fn sender(&self) -> ClientSender {
        ClientSender {
            commands: self.inner.commands.downgrade(),
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| Error::ClientShutdown)
    }
}

// ============================================================================
// Client - Events and Dispatch
// ============================================================================

impl<S: StoreState> Client<S> {
    /// Subscribes to an event. Drop-safe: the listener stays until
    /// [`Subscription::unsubscribe`] or [`Client::off`].
    pub fn on<F, R>(&self, event: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Value) -> R + Send + Sync + 'static,
        R: ListenerOutcome,
    {
        self.inner.bus.subscribe(event, listener)
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.bus.off(event, id)
    }

    /// Appends a middleware to the dispatch pipeline.
    pub fn use_middleware<M: Middleware<S>>(&self, middleware: M) {
        self.inner.store.use_middleware(middleware);
    }

    /// Appends an async closure to the dispatch pipeline.
    pub fn use_fn<F, Fut>(&self, f: F)
    where
        F: Fn(MiddlewareContext<S>, Next<S>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.store.use_fn(f);
    }

    /// Registers a state handler for an action type.
    pub fn define_action<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&S, Option<&Value>) -> std::result::Result<Option<S>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.inner.store.define_action(kind, handler);
    }

    /// Dispatches an action through the pipeline.
    ///
    /// # Errors
    ///
    /// See [`Store::dispatch`].
    pub async fn dispatch(&self, kind: impl Into<String>, payload: Option<Value>) -> Result<()> {
        self.inner.store.dispatch(kind, payload).await
    }
}

// ============================================================================
// Client - Accessors
// ============================================================================

impl<S: StoreState> Client<S> {
    /// Identifier recorded on this client's log lines.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Options the client was built with.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.machine.state()
    }

    /// Receiver observing every connection state change.
    #[inline]
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.machine.subscribe()
    }

    /// Snapshot of the store state.
    #[inline]
    #[must_use]
    pub fn store_state(&self) -> S {
        self.inner.store.state()
    }

    /// The dispatch store.
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Store<S> {
        &self.inner.store
    }

    /// The event bus.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Payloads waiting for a connection, oldest first.
    #[must_use]
    pub fn queued(&self) -> Vec<Value> {
        self.inner.shared.queue.lock().payloads().cloned().collect()
    }

    /// Returns `true` while a reattempt timer is armed.
    #[inline]
    #[must_use]
    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.shared.reconnect_pending.load(Ordering::Acquire)
    }
}

// ============================================================================
// ClientSender
// ============================================================================

/// Send-only handle that does not keep the client alive.
///
/// Meant for middleware and listeners, which are owned by the client
/// itself.
#[derive(Debug, Clone)]
pub struct ClientSender {
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl ClientSender {
    /// Sends or queues a payload, like [`Client::send`].
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the payload does not serialize
    /// - [`Error::ClientShutdown`] if every client handle is gone
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        let commands = self.commands.upgrade().ok_or(Error::ClientShutdown)?;
        commands
            .send(Command::Send(value))
            .map_err(|_| Error::ClientShutdown)
    }
}

// ============================================================================
// Tests
// ============================================================================
