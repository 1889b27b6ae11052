//! # parley-transport
//!
//! The real-time channel underneath a Parley connection.
//!
//! A [`TransportFactory`] opens one [`Transport`] per connection attempt and
//! hands back the stream of [`TransportEvent`]s it produces. The connection
//! supervisor owns both halves; nothing else touches the socket.
//!
//! Implementations:
//! - [`websocket::WebSocketFactory`]: `tokio-tungstenite`, the native runtime choice
//! - [`memory::MemoryTransportFactory`]: in-process channel pair, injected by
//!   embedders that bring their own socket and by tests
//!
//! [`selector::select_factory`] picks one at construction time.

#![deny(unsafe_code)]

pub mod error;
pub mod memory;
pub mod selector;
pub mod traits;
pub mod websocket;

pub use error::TransportError;
pub use memory::{MemoryPeer, MemoryTransportFactory};
pub use selector::{TransportKind, select_factory};
pub use traits::{OpenedTransport, ReadyState, Transport, TransportEvent, TransportFactory};
pub use websocket::WebSocketFactory;
