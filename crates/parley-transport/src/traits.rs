//! Transport capability set.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::TransportError;
use crate::selector::TransportKind;

/// Socket ready state, mirroring the WebSocket lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Dialing.
    Connecting,
    /// Frames can be sent.
    Open,
    /// A close frame has been sent; waiting for the peer.
    Closing,
    /// Finished.
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Something the channel reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Transport-level open. Not the backend handshake.
    Open,
    /// A text frame.
    Message(String),
    /// The channel closed. Always the last event.
    Close {
        /// Close code (1000 is a normal close).
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The channel reported an error. A `Close` follows.
    Error(String),
}

/// An open channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current ready state.
    fn state(&self) -> ReadyState;

    /// Send one text frame. Fails unless the state is [`ReadyState::Open`].
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Start a close handshake with `code`. Closing an already closed
    /// channel is a no-op.
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// A freshly opened channel and its event stream.
pub struct OpenedTransport {
    /// Sending half.
    pub transport: Arc<dyn Transport>,
    /// Events in arrival order, ending with [`TransportEvent::Close`].
    pub events: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for OpenedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedTransport")
            .field("state", &self.transport.state())
            .finish_non_exhaustive()
    }
}

/// Opens transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> TransportKind {
        TransportKind::Injected
    }

    /// Open a new channel to `url`.
    async fn open(&self, url: &Url) -> Result<OpenedTransport, TransportError>;
}
