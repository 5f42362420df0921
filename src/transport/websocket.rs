//! WebSocket transport on tokio-tungstenite.
//!
//! # Socket Task
//!
//! `open` spawns one task per connection. The task connects, reports
//! `open`, then loops over:
//!
//! - Inbound frames from the server (text, binary, close)
//! - Outbound frames and close requests from the handle
//!
//! Every exit path reports exactly one `close` notification, except when the
//! handle was dropped, in which case nobody is listening.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{CloseInfo, codes};

use super::{Transport, TransportEvents, TransportHandle};

// ============================================================================
// Constants
// ============================================================================

/// Default limit for the TCP and WebSocket handshakes.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the server to acknowledge a close frame.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Opens `ws://` and `wss://` connections.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl WebSocketTransport {
    /// Creates a transport with the default connect timeout.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns the handshake timeout.
    #[inline]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &Url, events: TransportEvents) -> Result<Box<dyn TransportHandle>> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::transport(format!(
                    "Unsupported scheme `{other}`, expected ws or wss"
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url.clone(), rx, events, self.connect_timeout));

        Ok(Box::new(WebSocketHandle { tx }))
    }
}

// ============================================================================
// WebSocketHandle
// ============================================================================

/// Requests from the handle to the socket task.
#[derive(Debug)]
enum Outbound {
    /// Write a text frame.
    Text(String),
    /// Start the closing handshake.
    Close { code: u16, reason: String },
}

/// Handle to one socket task. Dropping it tears the socket down silently.
#[derive(Debug)]
struct WebSocketHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TransportHandle for WebSocketHandle {
    fn send(&self, raw: &str) -> Result<()> {
        self.tx
            .send(Outbound::Text(raw.to_owned()))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_owned(),
        });
    }
}

// ============================================================================
// Socket Task
// ============================================================================

async fn run_socket(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEvents,
    connect_timeout: Duration,
) {
    let stream = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!(url = %url, error = %e, "WebSocket connect failed");
            events.error(e.to_string());
            events.close(CloseInfo::abnormal(e.to_string()));
            return;
        }
        Err(_) => {
            let message = format!("Connect timed out after {}ms", connect_timeout.as_millis());
            warn!(url = %url, "{message}");
            events.error(message.clone());
            events.close(CloseInfo::abnormal(message));
            return;
        }
    };

    debug!(url = %url, "WebSocket connected");
    events.open();

    let (mut ws_write, mut ws_read) = stream.split();

    let close = loop {
        tokio::select! {
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        trace!(len = text.len(), "Inbound text frame");
                        events.message(text.as_str());
                    }

                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => events.message(text),
                        Err(_) => trace!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
                    },

                    Some(Ok(Message::Close(frame))) => {
                        debug!("WebSocket closed by remote");
                        // tungstenite queued the close reply; push it out
                        if let Err(e) = ws_write.flush().await {
                            trace!(error = %e, "Close reply not delivered");
                        }
                        break close_info(frame);
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        events.error(e.to_string());
                        break CloseInfo::abnormal(e.to_string());
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break CloseInfo::abnormal("Stream ended");
                    }

                    // Ping, Pong and raw frames are handled by tungstenite
                    Some(Ok(_)) => {}
                }
            }

            command = outbound.recv() => {
                match command {
                    Some(Outbound::Text(raw)) => {
                        if let Err(e) = ws_write.send(Message::Text(raw.into())).await {
                            warn!(error = %e, "Failed to write frame");
                            events.error(e.to_string());
                            break CloseInfo::abnormal(e.to_string());
                        }
                    }

                    Some(Outbound::Close { code, reason }) => {
                        debug!(code, reason = %reason, "Closing WebSocket");
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = ws_write.send(Message::Close(Some(frame))).await;

                        break match timeout(CLOSE_ACK_TIMEOUT, await_close_ack(&mut ws_read)).await {
                            Ok(true) => CloseInfo::new(code, reason, true),
                            _ => CloseInfo::new(code, reason, false),
                        };
                    }

                    None => {
                        debug!("Handle dropped, closing WebSocket");
                        let _ = ws_write.close().await;
                        return;
                    }
                }
            }
        }
    };

    events.close(close);
    debug!("Socket task terminated");
}

/// Drains inbound frames until the server's close frame arrives.
async fn await_close_ack<S>(read: &mut S) -> bool
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(Ok(message)) = read.next().await {
        if matches!(message, Message::Close(_)) {
            return true;
        }
    }
    false
}

/// Converts a received close frame.
fn close_info(frame: Option<CloseFrame>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.as_str(), true),
        None => CloseInfo::new(codes::NO_STATUS, "", true),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_async;

    use crate::transport::{StampedEvent, TransportEvent};

    /// Binds a one-shot echo server on a random port.
    async fn echo_server() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) if text.as_str() == "bye" => {
                        let frame = CloseFrame {
                            code: CloseCode::Away,
                            reason: "server leaving".into(),
                        };
                        let _ = ws.close(Some(frame)).await;
                    }
                    Message::Text(text) => {
                        let _ = ws.send(Message::Text(text)).await;
                    }
                    _ => {}
                }
            }
        });

        Url::parse(&format!("ws://127.0.0.1:{port}")).unwrap()
    }

    /// Binds a server that closes every connection right after the
    /// handshake and reports whether the client answered the close.
    async fn closing_server() -> (Url, oneshot::Receiver<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (acked_tx, acked_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let frame = CloseFrame {
                code: CloseCode::Away,
                reason: "maintenance".into(),
            };
            ws.close(Some(frame)).await.unwrap();

            let mut acked = false;
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Close(_)) {
                    acked = true;
                }
            }
            let _ = acked_tx.send(acked);
        });

        (Url::parse(&format!("ws://127.0.0.1:{port}")).unwrap(), acked_rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<StampedEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
            .event
    }

    #[test]
    fn test_defaults() {
        assert_eq!(WebSocketTransport::new().connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        let custom = WebSocketTransport::new().with_connect_timeout(Duration::from_secs(2));
        assert_eq!(custom.connect_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_close_info_without_frame() {
        assert_eq!(close_info(None), CloseInfo::new(codes::NO_STATUS, "", true));
    }

    #[test]
    fn test_close_info_from_frame() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        };
        assert_eq!(close_info(Some(frame)), CloseInfo::normal("done"));
    }

    #[tokio::test]
    async fn test_rejects_non_ws_scheme() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let url = Url::parse("http://localhost:1").unwrap();
        let result = WebSocketTransport::new().open(&url, TransportEvents::new(0, tx));
        assert!(matches!(result, Err(Error::Transport { .. })));
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let url = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = WebSocketTransport::new()
            .open(&url, TransportEvents::new(1, tx))
            .unwrap();

        assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
        handle.send(r#"{"n":1}"#).unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(r#"{"n":1}"#.into())
        );
    }

    #[tokio::test]
    async fn test_remote_close_reports_code() {
        let url = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = WebSocketTransport::new()
            .open(&url, TransportEvents::new(1, tx))
            .unwrap();

        assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
        handle.send("bye").unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Close(CloseInfo::new(codes::GOING_AWAY, "server leaving", true))
        );
    }

    #[tokio::test]
    async fn test_remote_close_is_answered() {
        let (url, acked) = closing_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = WebSocketTransport::new()
            .open(&url, TransportEvents::new(1, tx))
            .unwrap();

        assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Close(CloseInfo::new(codes::GOING_AWAY, "maintenance", true))
        );

        let acked = timeout(Duration::from_secs(5), acked).await.unwrap().unwrap();
        assert!(acked, "server never saw the close reply");
    }

    #[tokio::test]
    async fn test_local_close_is_acknowledged() {
        let url = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = WebSocketTransport::new()
            .open(&url, TransportEvents::new(1, tx))
            .unwrap();

        assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
        handle.close(codes::NORMAL_CLOSURE, "Client closed");
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Close(CloseInfo::normal("Client closed"))
        );
    }

    #[tokio::test]
    async fn test_refused_connection_reports_abnormal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://127.0.0.1:{port}")).unwrap();
        let _handle = WebSocketTransport::new()
            .open(&url, TransportEvents::new(1, tx))
            .unwrap();

        assert!(matches!(next_event(&mut rx).await, TransportEvent::Error(_)));
        match next_event(&mut rx).await {
            TransportEvent::Close(close) => {
                assert_eq!(close.code, codes::ABNORMAL_CLOSURE);
                assert!(!close.was_clean);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }
}
