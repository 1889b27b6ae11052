//! Wire envelope.
//!
//! Outbound (real-time and REST alike):
//!
//! ```text
//! { "action": "sendMessage",
//!   "event": { "event_type": "...", "event_payload": {...}, "socket_id": "..." } }
//! ```
//!
//! Inbound frames and REST responses share the `{ event: { event_type, event_payload } }`
//! shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{PAYLOAD_TOO_LARGE, SEND_MESSAGE_ACTION};
use crate::errors::{ParleyError, Result};
use crate::ids::{ConversationId, MessageId, SocketId};

/// Outbound request envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Action discriminator, always [`SEND_MESSAGE_ACTION`].
    pub action: String,
    /// The event body.
    pub event: EnvelopeEvent,
}

/// Body of an [`Envelope`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeEvent {
    /// Outbound event-type discriminator.
    pub event_type: String,
    /// Operation-specific payload.
    pub event_payload: Value,
    /// Backend connection id, attached for REST-style delivery only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<SocketId>,
}

impl Envelope {
    /// Build an envelope for `event_type` with the given payload object.
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            action: SEND_MESSAGE_ACTION.to_string(),
            event: EnvelopeEvent {
                event_type: event_type.into(),
                event_payload: Value::Object(payload),
                socket_id: None,
            },
        }
    }

    /// Attach the backend connection id (REST delivery).
    #[must_use]
    pub fn with_socket_id(mut self, socket_id: SocketId) -> Self {
        self.event.socket_id = Some(socket_id);
        self
    }

    /// Event type of this envelope.
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    /// Serialize to the JSON text sent over the wire.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ParleyError::Protocol {
            message: format!("failed to serialize {} envelope: {e}", self.event.event_type),
        })
    }
}

/// Builder for an outbound payload object.
///
/// Keeps the conversation id and message id under their wire names so every
/// call site spells them the same way.
#[derive(Clone, Debug, Default)]
pub struct PayloadBuilder {
    fields: Map<String, Value>,
}

impl PayloadBuilder {
    /// Start an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `conversation_id`.
    #[must_use]
    pub fn conversation(self, id: &ConversationId) -> Self {
        self.field("conversation_id", Value::String(id.to_string()))
    }

    /// Set `message_id`.
    #[must_use]
    pub fn message(self, id: &MessageId) -> Self {
        self.field("message_id", Value::String(id.to_string()))
    }

    /// Set an arbitrary field.
    #[must_use]
    pub fn field(mut self, key: &str, value: Value) -> Self {
        let _ = self.fields.insert(key.to_string(), value);
        self
    }

    /// Set a field only when `value` is `Some`.
    #[must_use]
    pub fn optional(self, key: &str, value: Option<Value>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    /// Finish into an envelope.
    pub fn into_envelope(self, event_type: &str) -> Envelope {
        Envelope::new(event_type, self.fields)
    }
}

/// Inbound frame (also the REST response body).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// The event body.
    pub event: InboundEvent,
}

/// Body of an [`InboundFrame`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Inbound event-type discriminator.
    pub event_type: String,
    /// Event payload; `null` when absent.
    #[serde(default)]
    pub event_payload: Value,
    /// Some handshake variants carry the socket id beside the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<SocketId>,
}

impl InboundFrame {
    /// Parse a raw text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ParleyError::Protocol {
            message: format!("malformed inbound frame: {e}"),
        })
    }

    /// Build a frame directly (tests and REST adapters).
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event: InboundEvent {
                event_type: event_type.into(),
                event_payload: payload,
                socket_id: None,
            },
        }
    }

    /// Event type discriminator.
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    /// Event payload.
    pub fn payload(&self) -> &Value {
        &self.event.event_payload
    }

    /// Socket id from a `socket_connected` frame, looked up beside or inside
    /// the payload.
    pub fn socket_id(&self) -> Option<SocketId> {
        self.event.socket_id.clone().or_else(|| {
            self.event
                .event_payload
                .get("socket_id")
                .and_then(Value::as_str)
                .map(SocketId::from)
        })
    }
}

/// Read `conversation_id` from a payload.
pub fn payload_conversation_id(payload: &Value) -> Option<&str> {
    payload.get("conversation_id").and_then(Value::as_str)
}

/// A `general_error` payload, decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteErrorEvent {
    /// Backend error code, as text (numeric codes are stringified).
    pub code: String,
    /// Human-readable description.
    pub description: String,
    /// Out-of-band retrieval link for oversized payloads.
    pub message_link: Option<String>,
    /// Conversation the error belongs to, if any.
    pub conversation_id: Option<String>,
}

impl RemoteErrorEvent {
    /// Decode from a `general_error` payload. Missing fields become empty.
    pub fn from_payload(payload: &Value) -> Self {
        let code = match payload.get("error_code") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        Self {
            code,
            description: payload
                .get("error_desc")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            message_link: payload
                .get("message_link")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from),
            conversation_id: payload_conversation_id(payload).map(String::from),
        }
    }

    /// Whether this is the oversized-payload signal with a retrieval link.
    pub fn is_oversize_with_link(&self) -> bool {
        self.message_link.is_some() && self.code == PAYLOAD_TOO_LARGE.to_string()
    }

    /// Convert into the error surfaced to callers.
    pub fn into_error(self) -> ParleyError {
        ParleyError::Remote {
            code: self.code,
            description: self.description,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
