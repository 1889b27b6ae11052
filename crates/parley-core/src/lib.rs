//! # parley-core
//!
//! Foundation types shared by every Parley crate.
//!
//! - **Branded IDs**: `ConversationId`, `MessageId`, `SocketId`, `UserId` newtypes
//! - **Wire format**: outbound [`envelope::Envelope`] and inbound [`envelope::InboundFrame`]
//! - **Event vocabulary**: event-type constants in [`constants`]
//! - **Content**: opaque message content helpers and the typed [`content::Files`] container
//! - **Errors**: [`errors::ParleyError`] taxonomy via `thiserror`
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod constants;
pub mod content;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;

pub use errors::{ErrorKind, ParleyError, Result};
pub use ids::{ApiKey, ConversationId, MessageId, SocketId, UserId};
