//! In-process transport.
//!
//! [`MemoryTransport`] never touches the network. Every `open` creates a
//! [`MemoryPeer`] that plays the server side: it accepts the connection,
//! pushes frames, drops the link with a chosen close code and records what
//! the client sent.
//!
//! # Example
//!
//! ```ignore
//! let transport = MemoryTransport::new();
//! let client = Client::builder("ws://test").transport(transport.clone()).build()?;
//!
//! let peer = transport.last_peer().unwrap();
//! peer.push(r#"{"data":"hello"}"#);
//! peer.drop_with(1006, "network lost");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{CloseInfo, codes};

use super::{Transport, TransportEvents, TransportHandle};

// ============================================================================
// MemoryTransport
// ============================================================================

/// Transport whose connections live in memory.
///
/// Cloning shares the same peer registry.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Debug)]
struct Registry {
    /// Report `open` as soon as a connection is created.
    auto_accept: bool,
    /// `open` calls left to fail synchronously.
    reject_opens: u32,
    /// `open` calls left to fail asynchronously, as an unreachable server.
    refuse_connects: u32,
    /// Every connection ever created, in order.
    peers: Vec<MemoryPeer>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Creates a transport whose connections open immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::with_auto_accept(true)
    }

    /// Creates a transport whose connections stay pending until
    /// [`MemoryPeer::accept`] is called.
    #[must_use]
    pub fn manual() -> Self {
        Self::with_auto_accept(false)
    }

    fn with_auto_accept(auto_accept: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                auto_accept,
                reject_opens: 0,
                refuse_connects: 0,
                peers: Vec::new(),
            })),
        }
    }

    /// Makes the next `count` calls to `open` return an error.
    pub fn reject_next_opens(&self, count: u32) {
        self.inner.lock().reject_opens = count;
    }

    /// Makes the next `count` connections fail with an abnormal closure
    /// instead of opening.
    pub fn refuse_next_connects(&self, count: u32) {
        self.inner.lock().refuse_connects = count;
    }

    /// Number of connections created.
    #[inline]
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// URLs of every connection created, in order.
    #[must_use]
    pub fn opened_urls(&self) -> Vec<Url> {
        self.inner
            .lock()
            .peers
            .iter()
            .map(|peer| peer.url().clone())
            .collect()
    }

    /// Every connection created, in order.
    #[must_use]
    pub fn peers(&self) -> Vec<MemoryPeer> {
        self.inner.lock().peers.clone()
    }

    /// The most recent connection.
    #[must_use]
    pub fn last_peer(&self) -> Option<MemoryPeer> {
        self.inner.lock().peers.last().cloned()
    }
}

impl Transport for MemoryTransport {
    fn open(&self, url: &Url, events: TransportEvents) -> Result<Box<dyn TransportHandle>> {
        let (auto_accept, refuse) = {
            let mut registry = self.inner.lock();
            if registry.reject_opens > 0 {
                registry.reject_opens -= 1;
                return Err(Error::transport(format!("Connection to {url} rejected")));
            }
            let refuse = registry.refuse_connects > 0;
            if refuse {
                registry.refuse_connects -= 1;
            }
            (registry.auto_accept, refuse)
        };

        let peer = MemoryPeer {
            shared: Arc::new(PeerShared {
                url: url.clone(),
                events,
                state: Mutex::new(PeerState::default()),
            }),
        };
        self.inner.lock().peers.push(peer.clone());
        trace!(url = %url, "Memory connection created");

        if refuse {
            peer.error("Connection refused");
            peer.drop_with(codes::ABNORMAL_CLOSURE, "Connection refused");
        } else if auto_accept {
            peer.accept();
        }

        Ok(Box::new(MemoryHandle {
            shared: Arc::clone(&peer.shared),
        }))
    }
}

// ============================================================================
// MemoryPeer
// ============================================================================

#[derive(Debug)]
struct PeerShared {
    url: Url,
    events: TransportEvents,
    state: Mutex<PeerState>,
}

#[derive(Debug, Default)]
struct PeerState {
    /// Frames written by the client.
    sent: Vec<String>,
    /// Sends left to fail.
    fail_sends: u32,
    /// Set once either side closed.
    closed: bool,
    /// Close requested by the client.
    close_request: Option<(u16, String)>,
}

/// Server side of one in-memory connection.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    shared: Arc<PeerShared>,
}

impl MemoryPeer {
    /// Address the client connected to.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Reports the connection as open.
    pub fn accept(&self) {
        self.shared.events.open();
    }

    /// Delivers a raw frame to the client.
    pub fn push(&self, raw: impl Into<String>) {
        self.shared.events.message(raw);
    }

    /// Delivers a JSON frame to the client.
    pub fn push_json(&self, value: &Value) {
        self.shared.events.message(value.to_string());
    }

    /// Reports a transport error without closing.
    pub fn error(&self, info: impl Into<String>) {
        self.shared.events.error(info);
    }

    /// Closes the connection from the server side.
    pub fn drop_with(&self, code: u16, reason: &str) {
        self.shared.state.lock().closed = true;
        let was_clean = code == codes::NORMAL_CLOSURE;
        self.shared
            .events
            .close(CloseInfo::new(code, reason, was_clean));
    }

    /// Makes the next `count` client sends fail.
    pub fn fail_next_sends(&self, count: u32) {
        self.shared.state.lock().fail_sends = count;
    }

    /// Raw frames the client wrote, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.shared.state.lock().sent.clone()
    }

    /// Frames the client wrote, parsed as JSON where possible.
    #[must_use]
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())))
            .collect()
    }

    /// Returns `true` once either side closed the connection.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Code and reason of the client's close request, if any.
    #[must_use]
    pub fn close_request(&self) -> Option<(u16, String)> {
        self.shared.state.lock().close_request.clone()
    }
}

// ============================================================================
// MemoryHandle
// ============================================================================

struct MemoryHandle {
    shared: Arc<PeerShared>,
}

impl TransportHandle for MemoryHandle {
    fn send(&self, raw: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(Error::transport("Injected send failure"));
        }
        state.sent.push(raw.to_owned());
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.close_request = Some((code, reason.to_owned()));
        }
        self.shared
            .events
            .close(CloseInfo::new(code, reason, true));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::transport::{StampedEvent, TransportEvent};

    fn drain(rx: &mut mpsc::UnboundedReceiver<StampedEvent>) -> Vec<TransportEvent> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|stamped| stamped.event)
            .collect()
    }

    fn url() -> Url {
        Url::parse("ws://memory.test/socket").unwrap()
    }

    #[test]
    fn test_auto_accept_opens_immediately() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.open(&url(), TransportEvents::new(0, tx)).unwrap();

        assert_eq!(drain(&mut rx), vec![TransportEvent::Open]);
        assert_eq!(transport.opened_urls(), vec![url()]);
    }

    #[test]
    fn test_manual_waits_for_accept() {
        let transport = MemoryTransport::manual();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.open(&url(), TransportEvents::new(0, tx)).unwrap();
        assert!(drain(&mut rx).is_empty());

        transport.last_peer().unwrap().accept();
        assert_eq!(drain(&mut rx), vec![TransportEvent::Open]);
    }

    #[test]
    fn test_reject_next_opens() {
        let transport = MemoryTransport::new();
        transport.reject_next_opens(1);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(transport.open(&url(), TransportEvents::new(0, tx.clone())).is_err());
        assert!(transport.open(&url(), TransportEvents::new(1, tx)).is_ok());
        assert_eq!(transport.open_count(), 1);
    }

    #[test]
    fn test_refused_connect_closes_abnormally() {
        let transport = MemoryTransport::new();
        transport.refuse_next_connects(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.open(&url(), TransportEvents::new(0, tx)).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TransportEvent::Error(_)));
        assert_eq!(
            events[1],
            TransportEvent::Close(CloseInfo::abnormal("Connection refused"))
        );
    }

    #[test]
    fn test_sends_are_recorded_and_can_fail() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = transport.open(&url(), TransportEvents::new(0, tx)).unwrap();
        let peer = transport.last_peer().unwrap();

        peer.fail_next_sends(1);
        assert!(handle.send(r#"{"a":1}"#).is_err());
        handle.send(r#"{"a":2}"#).unwrap();
        handle.send("plain").unwrap();

        assert_eq!(peer.sent_json(), vec![json!({ "a": 2 }), json!("plain")]);
    }

    #[test]
    fn test_client_close_is_recorded_once() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = transport.open(&url(), TransportEvents::new(0, tx)).unwrap();
        drain(&mut rx);

        handle.close(1000, "Client closed");
        handle.close(1000, "again");

        let peer = transport.last_peer().unwrap();
        assert!(peer.is_closed());
        assert_eq!(peer.close_request(), Some((1000, "Client closed".into())));
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(handle.send("late").is_err());
    }

    #[test]
    fn test_drop_with_marks_clean_only_for_normal() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.open(&url(), TransportEvents::new(0, tx)).unwrap();
        drain(&mut rx);

        transport.last_peer().unwrap().drop_with(1006, "lost");
        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::Close(CloseInfo::new(1006, "lost", false))]
        );
    }
}
