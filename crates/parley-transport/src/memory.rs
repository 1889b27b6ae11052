//! In-memory transport.
//!
//! Each [`open`](TransportFactory::open) creates a channel pair and queues the
//! far end as a [`MemoryPeer`]. Whoever holds the factory plays the backend:
//! accept the peer, push frames at the client, read what the client sent.
//! Embedders with their own socket bridge it through a peer; tests script
//! the backend the same way.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use parley_core::constants::CLOSE_ABNORMAL;
use parley_core::constants::inbound::SOCKET_CONNECTED;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::error::TransportError;
use crate::selector::TransportKind;
use crate::traits::{OpenedTransport, ReadyState, Transport, TransportEvent, TransportFactory};

const EVENT_BUFFER: usize = 256;

/// Factory whose transports are backed by in-process channels.
pub struct MemoryTransportFactory {
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
    fail_next: AtomicU32,
    opens: AtomicUsize,
}

impl Default for MemoryTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransportFactory {
    /// Create a factory with no pending peers.
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
            fail_next: AtomicU32::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    /// Wait for the next transport the client opens and return its far end.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }

    /// Take an already-opened peer without waiting.
    pub fn try_accept(&self) -> Option<MemoryPeer> {
        self.peers_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Make the next `n` opens fail with a connect error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Open attempts so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::InMemory
    }

    async fn open(&self, url: &Url) -> Result<OpenedTransport, TransportError> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            debug!(%url, attempt, "memory transport refusing open");
            return Err(TransportError::Connect {
                url: url.to_string(),
                message: "connection refused".into(),
            });
        }

        let state = Arc::new(RwLock::new(ReadyState::Open));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let _ = event_tx.try_send(TransportEvent::Open);

        let peer = MemoryPeer {
            from_client: out_rx,
            to_client: event_tx.clone(),
            state: state.clone(),
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| TransportError::Closed)?;
        debug!(%url, attempt, "memory transport opened");

        Ok(OpenedTransport {
            transport: Arc::new(MemoryTransport {
                outbound: Mutex::new(Some(out_tx)),
                events: event_tx,
                state,
            }),
            events: event_rx,
        })
    }
}

/// Client-side half of an in-memory channel.
pub struct MemoryTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<ReadyState>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn state(&self) -> ReadyState {
        *self.state.read()
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        let state = self.state();
        if state != ReadyState::Open {
            return Err(TransportError::NotOpen { state });
        }
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        {
            let mut state = self.state.write();
            if matches!(*state, ReadyState::Closing | ReadyState::Closed) {
                return Ok(());
            }
            *state = ReadyState::Closed;
        }
        drop(self.outbound.lock().take());
        let _ = self
            .events
            .send(TransportEvent::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }
}

/// Backend-side half of an in-memory channel.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<ReadyState>>,
}

impl MemoryPeer {
    /// State of the channel as the client sees it.
    pub fn state(&self) -> ReadyState {
        *self.state.read()
    }

    /// Push a raw text frame to the client. Returns `false` once the client
    /// stopped listening.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(TransportEvent::Message(text.into()))
            .await
            .is_ok()
    }

    /// Push an `{event: {event_type, event_payload}}` frame.
    pub async fn send_event(&self, event_type: &str, payload: Value) -> bool {
        let frame = json!({ "event": { "event_type": event_type, "event_payload": payload } });
        self.send_text(frame.to_string()).await
    }

    /// Send the backend handshake acknowledgment.
    pub async fn handshake(&self, socket_id: &str) -> bool {
        self.send_event(SOCKET_CONNECTED, json!({ "socket_id": socket_id }))
            .await
    }

    /// Next frame the client sent; `None` after the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame the client sent, parsed as JSON. Unparseable frames are
    /// returned as JSON strings.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// Close from the backend side with `code`.
    pub async fn close(&self, code: u16, reason: &str) {
        *self.state.write() = ReadyState::Closed;
        let _ = self
            .to_client
            .send(TransportEvent::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Report a transport error, followed by an abnormal close.
    pub async fn fail(&self, message: &str) {
        let _ = self
            .to_client
            .send(TransportEvent::Error(message.to_string()))
            .await;
        self.close(CLOSE_ABNORMAL, message).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://memory/ws").unwrap()
    }

    #[tokio::test]
    async fn open_emits_open_then_frames() {
        let factory = MemoryTransportFactory::new();
        let mut opened = factory.open(&url()).await.unwrap();
        let peer = factory.accept().await.unwrap();

        assert!(peer.handshake("s1").await);
        assert_eq!(opened.events.recv().await, Some(TransportEvent::Open));
        let Some(TransportEvent::Message(text)) = opened.events.recv().await else {
            panic!("expected a message");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["event"]["event_type"], "socket_connected");
        assert_eq!(frame["event"]["event_payload"]["socket_id"], "s1");
    }

    #[tokio::test]
    async fn client_frames_reach_peer() {
        let factory = MemoryTransportFactory::new();
        let opened = factory.open(&url()).await.unwrap();
        let mut peer = factory.accept().await.unwrap();

        opened.transport.send(r#"{"a":1}"#.into()).await.unwrap();
        assert_eq!(peer.recv_json().await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn client_close_ends_peer_stream() {
        let factory = MemoryTransportFactory::new();
        let mut opened = factory.open(&url()).await.unwrap();
        let mut peer = factory.accept().await.unwrap();

        opened.transport.close(1000, "done").await.unwrap();
        assert_eq!(opened.transport.state(), ReadyState::Closed);
        assert_eq!(peer.state(), ReadyState::Closed);
        assert!(peer.recv().await.is_none());

        let _open = opened.events.recv().await;
        assert_eq!(
            opened.events.recv().await,
            Some(TransportEvent::Close {
                code: 1000,
                reason: "done".into()
            })
        );
        let err = opened.transport.send("x".into()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotOpen { state: ReadyState::Closed }));
    }

    #[tokio::test]
    async fn peer_fail_sends_error_then_abnormal_close() {
        let factory = MemoryTransportFactory::new();
        let mut opened = factory.open(&url()).await.unwrap();
        let peer = factory.accept().await.unwrap();

        peer.fail("boom").await;
        assert_eq!(opened.events.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            opened.events.recv().await,
            Some(TransportEvent::Error("boom".into()))
        );
        assert!(matches!(
            opened.events.recv().await,
            Some(TransportEvent::Close { code: 1006, .. })
        ));
        assert_eq!(opened.transport.state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn fail_next_refuses_opens_and_counts_them() {
        let factory = MemoryTransportFactory::new();
        factory.fail_next(2);

        assert!(factory.open(&url()).await.is_err());
        assert!(factory.open(&url()).await.is_err());
        assert!(factory.open(&url()).await.is_ok());
        assert_eq!(factory.open_count(), 3);
        assert!(factory.try_accept().is_some());
        assert!(factory.try_accept().is_none());
    }
}
