//! Transport selection.
//!
//! The host decides once, at construction: an injected factory wins,
//! otherwise the native `tokio-tungstenite` socket is used.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::traits::TransportFactory;
use crate::websocket::WebSocketFactory;

/// Which transport implementation a factory produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// `tokio-tungstenite` WebSocket.
    Native,
    /// In-process channel pair.
    InMemory,
    /// Supplied by the embedder.
    Injected,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Native => "native",
            Self::InMemory => "in_memory",
            Self::Injected => "injected",
        };
        f.write_str(s)
    }
}

/// Pick the factory a connection will use.
pub fn select_factory(injected: Option<Arc<dyn TransportFactory>>) -> Arc<dyn TransportFactory> {
    let factory = injected.unwrap_or_else(|| Arc::new(WebSocketFactory::new()));
    debug!(kind = %factory.kind(), "transport selected");
    factory
}
