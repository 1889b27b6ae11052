//! Transport-level errors.

use parley_core::ParleyError;
use thiserror::Error;

use crate::traits::ReadyState;

/// Errors raised by a [`Transport`](crate::Transport) or its factory.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel could not be opened.
    #[error("failed to open {url}: {message}")]
    Connect {
        /// Endpoint that was dialed.
        url: String,
        /// Underlying cause.
        message: String,
    },

    /// A send was attempted while the channel was not open.
    #[error("channel is not open (state: {state})")]
    NotOpen {
        /// State at the time of the send.
        state: ReadyState,
    },

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The channel's driver task is gone.
    #[error("channel closed")]
    Closed,
}

impl From<TransportError> for ParleyError {
    fn from(err: TransportError) -> Self {
        ParleyError::Transport {
            message: err.to_string(),
        }
    }
}
