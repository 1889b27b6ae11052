//! # parley-client
//!
//! Real-time chat client core.
//!
//! - **[`ConnectionSupervisor`]**: one supervised connection per credential;
//!   handshake, bounded reconnect, unsolicited-close recovery
//! - **[`Correlator`]**: per-generation listener registry and one-shot reply
//!   correlation with timeouts
//! - **[`SessionRegistry`]**: at most one [`Conversation`] per id
//! - **[`SendPath`]**: fire-and-forget and confirmed delivery (real-time or
//!   REST), plus the reconnect guard
//! - **[`ParleyClient`]**: the public façade; [`ClientPool`] keys clients by
//!   credential

#![deny(unsafe_code)]

pub mod client;
pub mod conversation;
pub mod correlator;
pub mod files;
pub mod http;
pub mod listeners;
pub mod pool;
pub mod registry;
pub mod send_path;
pub mod supervisor;

pub use client::{
    ConversationMode, ConversationOptions, ParleyClient, ParleyClientBuilder, UserConversation,
    UserConversationsQuery,
};
pub use conversation::{Conversation, DeleteOptions};
pub use correlator::{Correlator, PendingReply};
pub use files::FileService;
pub use http::HttpSideChannel;
pub use listeners::{Callback, ListenerId, ListenerRegistry};
pub use pool::ClientPool;
pub use registry::SessionRegistry;
pub use send_path::{Confirmation, SendPath, with_reconnect_guard};
pub use supervisor::{ConnectedHook, ConnectionState, ConnectionSupervisor};
