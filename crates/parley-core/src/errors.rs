//! Error taxonomy for the Parley client.
//!
//! [`ParleyError`] is returned from every public async operation. Each
//! variant carries enough context to render a message naming the operation
//! and the cause. [`ErrorKind`] offers a coarse classification for callers
//! that branch on error class rather than message text.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the Parley crates.
pub type Result<T> = std::result::Result<T, ParleyError>;

/// Top-level client error.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Malformed caller input, rejected before any network activity.
    #[error("Invalid input for {operation}: {message}")]
    Validation {
        /// Operation that rejected the input.
        operation: String,
        /// What was wrong.
        message: String,
    },

    /// The underlying channel failed to open, errored, or refused a send.
    #[error("Transport error: {message}")]
    Transport {
        /// Transport-level cause.
        message: String,
    },

    /// A confirmed operation received no correlated reply in time.
    #[error("Timeout: No response for {operation} after {timeout_ms}ms")]
    Timeout {
        /// Human-readable operation name, e.g. `metadata update`.
        operation: String,
        /// Budget that elapsed.
        timeout_ms: u64,
    },

    /// The bounded reconnect budget was consumed.
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A guarded operation could not run because reconnecting failed.
    #[error("Reconnection failed before {operation}: {source}")]
    ReconnectGuard {
        /// The operation that was about to run.
        operation: String,
        /// Why reconnecting failed.
        #[source]
        source: Box<ParleyError>,
    },

    /// The backend explicitly reported a failure.
    #[error("Remote error {code}: {description}")]
    Remote {
        /// Backend error code.
        code: String,
        /// Backend description.
        description: String,
    },

    /// Fetching an oversized message out-of-band failed.
    #[error("Error fetching large message: {message}")]
    OversizeRecovery {
        /// Fetch failure cause.
        message: String,
    },

    /// The REST side channel returned a non-success status.
    #[error("HTTP {status} from {operation}: {message}")]
    Http {
        /// Operation issuing the request.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Response body or client error text.
        message: String,
    },

    /// A frame or response did not have the expected shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// What was malformed.
        message: String,
    },

    /// A conversation handle outlived the client that created it.
    #[error("Connection dropped: the owning client no longer exists")]
    ConnectionDropped,
}

/// Coarse error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad caller input.
    Validation,
    /// Channel failure.
    Transport,
    /// Reply did not arrive in time.
    Timeout,
    /// Reconnect budget consumed.
    ReconnectExhausted,
    /// Backend-reported failure.
    Remote,
    /// Out-of-band fetch failed.
    OversizeRecovery,
    /// Malformed data.
    Protocol,
    /// Conversation handle detached from its client.
    ConnectionDropped,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ReconnectExhausted => "reconnect_exhausted",
            Self::Remote => "remote",
            Self::OversizeRecovery => "oversize_recovery",
            Self::Protocol => "protocol",
            Self::ConnectionDropped => "connection_dropped",
        };
        f.write_str(s)
    }
}

impl ParleyError {
    /// Shorthand for a validation error.
    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Shorthand for a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Transport { .. } | Self::Http { .. } => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ReconnectExhausted { .. } | Self::ReconnectGuard { .. } => {
                ErrorKind::ReconnectExhausted
            }
            Self::Remote { .. } => ErrorKind::Remote,
            Self::OversizeRecovery { .. } => ErrorKind::OversizeRecovery,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::ConnectionDropped => ErrorKind::ConnectionDropped,
        }
    }

    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
