//! Connection driver task.
//!
//! One task per client owns the transport handle, the reconnector, and
//! queue flushing. It reacts to four inputs:
//!
//! | Input | Source |
//! |-------|--------|
//! | commands | [`Client`](super::Client) calls: connect, send, close |
//! | transport events | the live handle, stamped with its generation |
//! | reconnect ticks | the reconnector's timer |
//! | tokens | the token acquisition task of the current attempt |
//! | idle deadline | last traffic + `idleTimeout` |
//!
//! Because everything connection related happens on this task, transitions,
//! flushes and reattempts never interleave. Token acquisition runs on its own
//! task so a slow provider never blocks `close()`.
//!
//! # Lifecycle
//!
//! | Transport event | Reaction |
//! |-----------------|----------|
//! | open | transition `connected`, reset attempts, dispatch `open`, flush queue |
//! | message | decode, dispatch `message` |
//! | error | emit `error` |
//! | close | dispatch `close`, transition `close`, schedule reattempt or settle at `CLOSED` |
//!
//! The task stops when every [`Client`](super::Client) clone is dropped.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};
use url::Url;

use crate::auth::{TokenProvider, authorized_url};
use crate::connection::{
    ConnectionState, LifecycleEvent, MessageQueue, Reconnector, RetryDecision, StateMachine,
};
use crate::error::Result;
use crate::events::{EventBus, names};
use crate::protocol::{CloseInfo, PayloadCodec, codes};
use crate::store::{Store, StoreState, actions};
use crate::transport::{StampedEvent, Transport, TransportEvent, TransportEvents, TransportHandle};

// ============================================================================
// Constants
// ============================================================================

/// Reason sent with a client-initiated close.
pub(crate) const CLIENT_CLOSE_REASON: &str = "Client closed";

/// Reason sent when the last client handle is dropped.
const CLIENT_DROPPED_REASON: &str = "Client dropped";

// ============================================================================
// Command
// ============================================================================

/// Requests from client handles.
#[derive(Debug)]
pub(crate) enum Command {
    /// Open a connection unless one is live or pending.
    Connect,
    /// Send now if open, queue otherwise.
    Send(Value),
    /// Tear down and acknowledge.
    Close(oneshot::Sender<()>),
}

// ============================================================================
// Tokens
// ============================================================================

/// Outcome of one token acquisition.
#[derive(Debug)]
pub(crate) struct TokenReady {
    /// Ticket of the acquisition that produced it.
    ticket: u64,
    result: Result<String>,
}

/// Token acquisition in flight.
#[derive(Debug)]
struct PendingToken {
    ticket: u64,
    task: JoinHandle<()>,
}

// ============================================================================
// Shared
// ============================================================================

/// Driver state readable from client handles.
#[derive(Debug)]
pub(crate) struct Shared {
    /// Messages waiting for a connection. Mutated only by the driver.
    pub queue: Mutex<MessageQueue>,
    /// Mirrors [`Reconnector::is_pending`].
    pub reconnect_pending: AtomicBool,
}

impl Shared {
    pub(crate) fn new(max_queue_size: usize) -> Self {
        Self {
            queue: Mutex::new(MessageQueue::new(max_queue_size)),
            reconnect_pending: AtomicBool::new(false),
        }
    }
}

// ============================================================================
// ConnectionDriver
// ============================================================================

/// Everything the driver needs, assembled by the builder.
pub(crate) struct DriverParts<S: StoreState> {
    pub url: Url,
    pub idle_timeout: Option<Duration>,
    pub transport: Arc<dyn Transport>,
    pub auth: Option<Arc<dyn TokenProvider>>,
    pub codec: Arc<dyn PayloadCodec>,
    pub machine: Arc<StateMachine>,
    pub store: Store<S>,
    pub bus: Arc<EventBus>,
    pub shared: Arc<Shared>,
    pub reconnector: Reconnector,
    pub events: mpsc::UnboundedSender<StampedEvent>,
    pub tokens: mpsc::UnboundedSender<TokenReady>,
}

/// The task body.
pub(crate) struct ConnectionDriver<S: StoreState> {
    url: Url,
    idle_timeout: Option<Duration>,
    transport: Arc<dyn Transport>,
    auth: Option<Arc<dyn TokenProvider>>,
    codec: Arc<dyn PayloadCodec>,
    machine: Arc<StateMachine>,
    store: Store<S>,
    bus: Arc<EventBus>,
    shared: Arc<Shared>,
    reconnector: Reconnector,
    /// Sender cloned into every [`TransportEvents`].
    events: mpsc::UnboundedSender<StampedEvent>,
    /// Sender cloned into every token task.
    tokens: mpsc::UnboundedSender<TokenReady>,
    /// Token acquisition of the current attempt.
    pending_token: Option<PendingToken>,
    /// Next token ticket.
    next_token_ticket: u64,
    /// Live transport handle.
    handle: Option<Box<dyn TransportHandle>>,
    /// Generation of the live handle; bumped whenever one is detached.
    generation: u64,
    /// Whether the live handle reported `open`.
    open: bool,
    /// When to emit `idle`, if armed.
    idle_deadline: Option<Instant>,
}

impl<S: StoreState> ConnectionDriver<S> {
    pub(crate) fn new(parts: DriverParts<S>) -> Self {
        Self {
            url: parts.url,
            idle_timeout: parts.idle_timeout,
            transport: parts.transport,
            auth: parts.auth,
            codec: parts.codec,
            machine: parts.machine,
            store: parts.store,
            bus: parts.bus,
            shared: parts.shared,
            reconnector: parts.reconnector,
            events: parts.events,
            tokens: parts.tokens,
            pending_token: None,
            next_token_ticket: 0,
            handle: None,
            generation: 0,
            open: false,
            idle_deadline: None,
        }
    }

    /// Runs until every command sender is gone.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<StampedEvent>,
        mut ticks: mpsc::UnboundedReceiver<u64>,
        mut tokens: mpsc::UnboundedReceiver<TokenReady>,
    ) {
        debug!(url = %self.url, "Driver started");

        loop {
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }

                Some(stamped) = events.recv() => {
                    self.handle_transport(stamped).await;
                }

                Some(ticket) = ticks.recv() => {
                    self.handle_tick(ticket).await;
                }

                Some(ready) = tokens.recv() => {
                    self.handle_token(ready).await;
                }

                () = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    self.handle_idle();
                }
            }

            self.shared
                .reconnect_pending
                .store(self.reconnector.is_pending(), Ordering::Release);
        }

        self.shutdown();
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.handle.is_some()
                    || self.pending_token.is_some()
                    || self.reconnector.is_pending()
                {
                    trace!("Connect ignored, attempt already live or pending");
                    return;
                }
                self.reconnector.reset();
                self.attempt().await;
            }

            Command::Send(payload) => self.send(payload),

            Command::Close(ack) => {
                self.close().await;
                let _ = ack.send(());
            }
        }
    }

    fn send(&mut self, payload: Value) {
        if self.open
            && let Some(handle) = &self.handle
        {
            let result = self
                .codec
                .encode(&payload)
                .and_then(|raw| handle.send(&raw));

            match result {
                Ok(()) => {
                    trace!("Message sent");
                    self.touch();
                }
                Err(e) => {
                    warn!(error = %e, "Send failed, message queued");
                    self.emit_error(&e.to_string());
                    self.enqueue(payload);
                }
            }
            return;
        }

        self.enqueue(payload);
    }

    fn enqueue(&self, payload: Value) {
        let evicted = {
            let mut queue = self.shared.queue.lock();
            let evicted = queue.enqueue(payload);
            trace!(queued = queue.len(), "Message queued");
            evicted
        };

        if let Some(evicted) = evicted {
            debug!("Queue full, oldest message evicted");
            self.bus.emit(names::EVICTED, &evicted.payload);
        }
    }

    async fn close(&mut self) {
        self.reconnector.cancel();
        self.cancel_token();
        self.shared.reconnect_pending.store(false, Ordering::Release);
        self.idle_deadline = None;

        if let Some(handle) = self.detach() {
            handle.close(codes::NORMAL_CLOSURE, CLIENT_CLOSE_REASON);
        }
        let was_open = std::mem::take(&mut self.open);

        if self.machine.state() == ConnectionState::Connected {
            self.machine.transition(LifecycleEvent::Disconnect);
        } else {
            self.settle_closed();
        }

        if was_open {
            let close = CloseInfo::normal(CLIENT_CLOSE_REASON);
            self.dispatch(actions::CLOSE, Some(close_payload(&close)))
                .await;
        }

        debug!("Client closed");
    }

    // ========================================================================
    // Connection Attempts
    // ========================================================================

    /// Starts one connection attempt.
    ///
    /// With a token provider the transport is opened once the token
    /// arrives on the tokens channel.
    async fn attempt(&mut self) {
        self.machine.transition(LifecycleEvent::Connecting);

        match &self.auth {
            Some(provider) => self.acquire_token(Arc::clone(provider)),
            None => self.open_transport(self.url.clone()).await,
        }
    }

    fn acquire_token(&mut self, provider: Arc<dyn TokenProvider>) {
        self.cancel_token();

        let ticket = self.next_token_ticket;
        self.next_token_ticket += 1;
        let tokens = self.tokens.clone();

        let task = tokio::spawn(async move {
            let result = provider.acquire_token().await;
            let _ = tokens.send(TokenReady { ticket, result });
        });
        debug!(ticket, "Acquiring token");
        self.pending_token = Some(PendingToken { ticket, task });
    }

    async fn handle_token(&mut self, ready: TokenReady) {
        if !self
            .pending_token
            .as_ref()
            .is_some_and(|pending| pending.ticket == ready.ticket)
        {
            trace!(ticket = ready.ticket, "Ignoring stale token");
            return;
        }
        self.pending_token = None;

        match ready.result {
            Ok(token) => {
                let url = authorized_url(&self.url, &token);
                self.open_transport(url).await;
            }
            Err(e) => {
                warn!(error = %e, "Token acquisition failed, attempt aborted");
                self.emit_error(&e.to_string());
                self.settle_closed();
            }
        }
    }

    /// Aborts the token acquisition in flight, if any.
    fn cancel_token(&mut self) {
        if let Some(pending) = self.pending_token.take() {
            pending.task.abort();
            trace!(ticket = pending.ticket, "Token acquisition cancelled");
        }
    }

    async fn open_transport(&mut self, url: Url) {
        self.generation += 1;
        let events = TransportEvents::new(self.generation, self.events.clone());
        debug!(generation = self.generation, "Opening transport");

        match self.transport.open(&url, events) {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                warn!(error = %e, "Transport open failed");
                self.emit_error(&e.to_string());
                self.on_closed(CloseInfo::abnormal(e.to_string())).await;
            }
        }
    }

    async fn handle_tick(&mut self, ticket: u64) {
        if !self.reconnector.take_due(ticket) {
            return;
        }

        debug!(attempt = self.reconnector.attempt(), "Reattempting connection");
        self.machine.transition(LifecycleEvent::Retry);
        self.attempt().await;
    }

    // ========================================================================
    // Transport Events
    // ========================================================================

    async fn handle_transport(&mut self, stamped: StampedEvent) {
        if stamped.generation != self.generation || self.handle.is_none() {
            trace!(generation = stamped.generation, "Ignoring event from detached transport");
            return;
        }

        match stamped.event {
            TransportEvent::Open => self.on_open().await,
            TransportEvent::Message(raw) => self.on_message(&raw).await,
            TransportEvent::Error(info) => {
                warn!(error = %info, "Transport error");
                self.emit_error(&info);
            }
            TransportEvent::Close(close) => {
                self.detach();
                self.open = false;
                self.on_closed(close).await;
            }
        }
    }

    async fn on_open(&mut self) {
        debug!("Transport open");
        self.open = true;
        self.reconnector.reset();
        self.machine.transition(LifecycleEvent::Connected);
        self.touch();

        self.dispatch(actions::OPEN, None).await;
        self.flush();
    }

    async fn on_message(&mut self, raw: &str) {
        trace!(len = raw.len(), "Message received");
        self.touch();
        let payload = self.codec.decode(raw);
        self.dispatch(actions::MESSAGE, Some(payload)).await;
    }

    async fn on_closed(&mut self, close: CloseInfo) {
        debug!(code = close.code, reason = %close.reason, clean = close.was_clean, "Transport closed");
        self.idle_deadline = None;

        self.dispatch(actions::CLOSE, Some(close_payload(&close)))
            .await;
        self.machine.transition(LifecycleEvent::Close);

        match self.reconnector.on_close(&close) {
            RetryDecision::Scheduled { attempt, delay } => {
                self.bus.emit(
                    names::RECONNECT_SCHEDULED,
                    &json!({ "attempt": attempt, "delayMs": duration_ms(delay) }),
                );
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(attempts, "Reconnect attempts exhausted");
                self.settle_closed();
                self.bus
                    .emit(names::RECONNECT_FAILED, &json!({ "attempts": attempts }));
            }
            RetryDecision::CleanClosure => self.settle_closed(),
        }
    }

    /// Sends queued messages over the open handle.
    fn flush(&mut self) {
        let Some(handle) = &self.handle else {
            return;
        };

        let codec = &self.codec;
        let report = self.shared.queue.lock().flush(|payload| {
            let raw = codec.encode(payload)?;
            handle.send(&raw)
        });

        if report.sent > 0 {
            self.touch();
        }
        if let Some(e) = report.error {
            warn!(error = %e, sent = report.sent, remaining = report.remaining, "Flush interrupted");
            self.emit_error(&e.to_string());
        }
    }

    // ========================================================================
    // Idle
    // ========================================================================

    /// Records traffic and re-arms the idle deadline.
    fn touch(&mut self) {
        if let Some(timeout) = self.idle_timeout
            && self.open
        {
            self.idle_deadline = Some(Instant::now() + timeout);
        }
    }

    fn handle_idle(&mut self) {
        self.idle_deadline = None;
        if let Some(timeout) = self.idle_timeout {
            debug!(idle_ms = duration_ms(timeout), "Connection idle");
            self.bus
                .emit(names::IDLE, &json!({ "idleMs": duration_ms(timeout) }));
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Drops the live handle so its later events are ignored.
    fn detach(&mut self) -> Option<Box<dyn TransportHandle>> {
        self.generation += 1;
        self.handle.take()
    }

    /// Moves a pending state to `CLOSED` through legal transitions.
    fn settle_closed(&self) {
        while matches!(
            self.machine.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            self.machine.transition(LifecycleEvent::Close);
        }
    }

    async fn dispatch(&self, kind: &str, payload: Option<Value>) {
        if let Err(e) = self.store.dispatch(kind, payload).await {
            debug!(action = kind, error = %e, "Dispatch from driver failed");
        }
    }

    fn emit_error(&self, message: &str) {
        self.bus.emit(names::ERROR, &json!({ "message": message }));
    }

    fn shutdown(&mut self) {
        self.reconnector.cancel();
        self.cancel_token();
        if let Some(handle) = self.detach() {
            handle.close(codes::NORMAL_CLOSURE, CLIENT_DROPPED_REASON);
        }
        debug!("Driver stopped");
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn close_payload(close: &CloseInfo) -> Value {
    json!({ "code": close.code, "reason": close.reason, "wasClean": close.was_clean })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
