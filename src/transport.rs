//! Pluggable transport layer for the event bus.
//!
//! The bus only ever sees the [`Transport`] trait: one `connect` call per
//! physical connection, returning a [`TransportLink`] — an outbound frame
//! sender plus an inbound stream of open/message/close events. Everything
//! transport-specific (sockets, handshakes, framing) stays behind it.
//!
//! Two implementations:
//! - [`WsTransport`] — production WebSocket transport over
//!   `tokio-tungstenite`, JSON text frames.
//! - [`MemoryTransport`] — in-process loopback for tests and local
//!   development, scriptable from a [`MemoryHub`] handle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Envelope;

/// Channel depth for one link's outbound and inbound queues.
const LINK_CHANNEL_CAPACITY: usize = 256;

/// Session credential presented to the transport on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Transport-level callbacks, surfaced as a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection finished its handshake.
    Open,
    /// A named event arrived.
    Message { event: String, payload: serde_json::Value },
    /// The connection closed; the reason is informational only.
    Closed { reason: String },
}

/// One physical connection: frames out, events in.
///
/// Dropping `outbound` tears the connection down from the client side.
pub struct TransportLink {
    pub outbound: mpsc::Sender<Envelope>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Transient connect failure — the bus retries under backoff.
    ConnectFailed(String),
    /// The credential was rejected — fatal, stops the retry loop.
    Unauthorized,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
            Self::Unauthorized => write!(f, "Credential rejected"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A factory for physical connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection. Implementations spawn their own reader and
    /// writer tasks; traffic flows through the returned link.
    async fn connect(&self, credential: &Credential) -> Result<TransportLink, TransportError>;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket transport
// ───────────────────────────────────────────────────────────────────

/// Production transport: one WebSocket, JSON text frames.
pub struct WsTransport {
    server_url: String,
}

impl WsTransport {
    /// `server_url` is the bare ws/wss endpoint; the credential token is
    /// appended as a query parameter on each connect.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, credential: &Credential) -> Result<TransportLink, TransportError> {
        let url = format!("{}?token={}", self.server_url, credential.token);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(LINK_CHANNEL_CAPACITY);

        // Writer task: drain the outbound channel into the socket.
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            // Outbound closed — say goodbye if the socket is still up.
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: map socket frames to transport events.
        let events = in_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => match Envelope::decode(text.as_str()) {
                        Ok(envelope) => {
                            if events
                                .send(TransportEvent::Message {
                                    event: envelope.event,
                                    payload: envelope.payload,
                                })
                                .await
                                .is_err()
                            {
                                break "receiver dropped".to_string();
                            }
                        }
                        Err(e) => {
                            log::debug!("Dropping undecodable frame: {e}");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = events.send(TransportEvent::Closed { reason }).await;
        });

        let _ = in_tx.send(TransportEvent::Open).await;

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory transport
// ───────────────────────────────────────────────────────────────────

/// In-process loopback transport.
///
/// The paired [`MemoryHub`] plays the server: it can push events, capture
/// everything the client sent, drop the link, and script connect failures.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

/// Server-side handle for a [`MemoryTransport`].
pub struct MemoryHub {
    refuse_connects: AtomicU32,
    reject_auth: AtomicBool,
    connects: AtomicU64,
    link: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    sent: Mutex<Vec<Envelope>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, Arc<MemoryHub>) {
        let hub = Arc::new(MemoryHub {
            refuse_connects: AtomicU32::new(0),
            reject_auth: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            link: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        });
        (Self { hub: hub.clone() }, hub)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, credential: &Credential) -> Result<TransportLink, TransportError> {
        let hub = &self.hub;
        hub.connects.fetch_add(1, Ordering::Relaxed);

        if hub.reject_auth.load(Ordering::Relaxed) || credential.token.is_empty() {
            return Err(TransportError::Unauthorized);
        }
        if hub.refuse_connects.load(Ordering::Relaxed) > 0 {
            hub.refuse_connects.fetch_sub(1, Ordering::Relaxed);
            return Err(TransportError::ConnectFailed("connection refused".into()));
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(LINK_CHANNEL_CAPACITY);

        // Capture task: record everything the client writes.
        let capture = self.hub.clone();
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                capture.sent.lock().unwrap().push(envelope);
            }
        });

        *hub.link.lock().unwrap() = Some(in_tx.clone());
        let _ = in_tx.send(TransportEvent::Open).await;

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MemoryHub {
    /// Push a server event to the currently connected client, if any.
    pub async fn push(&self, event: impl Into<String>, payload: serde_json::Value) {
        let link = self.link.lock().unwrap().clone();
        if let Some(tx) = link {
            let _ = tx
                .send(TransportEvent::Message {
                    event: event.into(),
                    payload,
                })
                .await;
        }
    }

    /// Drop the current link, as a network failure would.
    pub async fn drop_link(&self, reason: impl Into<String>) {
        let link = self.link.lock().unwrap().take();
        if let Some(tx) = link {
            let _ = tx
                .send(TransportEvent::Closed {
                    reason: reason.into(),
                })
                .await;
        }
    }

    /// Refuse the next `n` connect attempts with a transient error.
    pub fn refuse_next(&self, n: u32) {
        self.refuse_connects.store(n, Ordering::Relaxed);
    }

    /// Reject all connects as unauthorized until cleared.
    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::Relaxed);
    }

    /// Total connect attempts seen, including refused ones.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Everything the client has sent so far, in order.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    /// Drain the captured sends.
    pub fn take_sent(&self) -> Vec<Envelope> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_memory_transport_connects() {
        let (transport, hub) = MemoryTransport::new();
        let link = transport.connect(&Credential::new("tok")).await.unwrap();
        assert_eq!(hub.connect_count(), 1);
        drop(link);
    }

    #[tokio::test]
    async fn test_memory_transport_open_then_message() {
        let (transport, hub) = MemoryTransport::new();
        let mut link = transport.connect(&Credential::new("tok")).await.unwrap();

        assert_eq!(link.inbound.recv().await, Some(TransportEvent::Open));

        hub.push("task:updated", json!({"id": 7})).await;
        match link.inbound.recv().await {
            Some(TransportEvent::Message { event, payload }) => {
                assert_eq!(event, "task:updated");
                assert_eq!(payload, json!({"id": 7}));
            }
            other => panic!("Expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_transport_captures_sends() {
        let (transport, hub) = MemoryTransport::new();
        let link = transport.connect(&Credential::new("tok")).await.unwrap();

        link.outbound
            .send(Envelope::new("user:cursor", json!({"x": 1.0})))
            .await
            .unwrap();

        // The capture task runs on the same runtime; give it a beat.
        timeout(Duration::from_secs(1), async {
            loop {
                if !hub.sent().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let sent = hub.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, "user:cursor");
    }

    #[tokio::test]
    async fn test_memory_transport_refuses_then_accepts() {
        let (transport, hub) = MemoryTransport::new();
        hub.refuse_next(2);

        let cred = Credential::new("tok");
        assert!(matches!(
            transport.connect(&cred).await,
            Err(TransportError::ConnectFailed(_))
        ));
        assert!(matches!(
            transport.connect(&cred).await,
            Err(TransportError::ConnectFailed(_))
        ));
        assert!(transport.connect(&cred).await.is_ok());
        assert_eq!(hub.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_transport_rejects_auth() {
        let (transport, hub) = MemoryTransport::new();
        hub.set_reject_auth(true);
        assert!(matches!(
            transport.connect(&Credential::new("tok")).await,
            Err(TransportError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_memory_transport_drop_link() {
        let (transport, hub) = MemoryTransport::new();
        let mut link = transport.connect(&Credential::new("tok")).await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(TransportEvent::Open));

        hub.drop_link("network blip").await;
        match link.inbound.recv().await {
            Some(TransportEvent::Closed { reason }) => assert_eq!(reason, "network blip"),
            other => panic!("Expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_token_is_unauthorized() {
        let (transport, _hub) = MemoryTransport::new();
        assert!(matches!(
            transport.connect(&Credential::new("")).await,
            Err(TransportError::Unauthorized)
        ));
    }
}
