//! WebSocket transport over `tokio-tungstenite`.
//!
//! One driver task per socket owns both halves of the stream. The
//! [`WebSocketTransport`] handle talks to it over a command channel, and
//! inbound frames leave through the event channel returned by
//! [`WebSocketFactory::open`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use parley_core::constants::CLOSE_ABNORMAL;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::selector::TransportKind;
use crate::traits::{OpenedTransport, ReadyState, Transport, TransportEvent, TransportFactory};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer's close frame carried no code.
const CLOSE_NO_STATUS: u16 = 1005;

const EVENT_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 64;

/// Opens [`WebSocketTransport`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketFactory;

impl WebSocketFactory {
    /// Create the factory.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    async fn open(&self, url: &Url) -> Result<OpenedTransport, TransportError> {
        debug!(%url, "dialing websocket");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let state = Arc::new(RwLock::new(ReadyState::Open));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        // Open precedes every frame.
        let _ = event_tx.try_send(TransportEvent::Open);
        drop(tokio::spawn(socket_loop(ws, cmd_rx, event_tx, state.clone())));

        Ok(OpenedTransport {
            transport: Arc::new(WebSocketTransport { cmd_tx, state }),
            events: event_rx,
        })
    }
}

/// Command sent from the handle to the driver task.
enum SocketCommand {
    Send {
        text: String,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        code: u16,
        reason: String,
    },
}

/// Handle to a socket driven by a background task.
pub struct WebSocketTransport {
    cmd_tx: mpsc::Sender<SocketCommand>,
    state: Arc<RwLock<ReadyState>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn state(&self) -> ReadyState {
        *self.state.read()
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        let state = self.state();
        if state != ReadyState::Open {
            return Err(TransportError::NotOpen { state });
        }
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(SocketCommand::Send { text, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if matches!(self.state(), ReadyState::Closing | ReadyState::Closed) {
            return Ok(());
        }
        *self.state.write() = ReadyState::Closing;
        // A gone driver means the socket is already closed.
        let _ = self
            .cmd_tx
            .send(SocketCommand::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }
}

async fn socket_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<ReadyState>>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut closing = false;

    let (code, reason) = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !closing => {
                let Some(cmd) = cmd else {
                    // Handle dropped: close from our side.
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break (CLOSE_ABNORMAL, "transport dropped".to_string());
                };
                match cmd {
                    SocketCommand::Send { text, done } => {
                        let result = ws_tx
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(|e| TransportError::Send(e.to_string()));
                        let _ = done.send(result);
                    }
                    SocketCommand::Close { code, reason } => {
                        closing = true;
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if ws_tx.send(Message::Close(Some(frame))).await.is_err() {
                            break (code, String::new());
                        }
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Message(text.as_str().to_owned())).await.is_err() {
                            break (CLOSE_ABNORMAL, "event receiver dropped".to_string());
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                if events.send(TransportEvent::Message(text)).await.is_err() {
                                    break (CLOSE_ABNORMAL, "event receiver dropped".to_string());
                                }
                            }
                            Err(_) => debug!("dropping non-utf8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or((CLOSE_NO_STATUS, String::new()), |f| {
                            (u16::from(f.code), f.reason.as_str().to_owned())
                        });
                    }
                    // Ping/pong are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error");
                        let _ = events.send(TransportEvent::Error(e.to_string())).await;
                        break (CLOSE_ABNORMAL, e.to_string());
                    }
                    None => break (CLOSE_ABNORMAL, String::new()),
                }
            }
        }
    };

    *state.write() = ReadyState::Closed;
    debug!(code, %reason, "websocket closed");
    let _ = events.send(TransportEvent::Close { code, reason }).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
