//! Message content.
//!
//! The client forwards content verbatim: anything the content schema layer
//! produces (text, buttons, cards, html, markdown, files) travels as an
//! opaque [`serde_json::Value`]. This module only adds the pieces the
//! client itself needs: a plain-text constructor, the typed [`Files`]
//! container, and the [`InboundMessage`] delivered to message listeners.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Plain text content: `{ "type": "text", "text": ... }`.
pub fn text(body: impl Into<String>) -> Value {
    json!({ "type": "text", "text": body.into() })
}

/// One file attached to a message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Display name.
    pub name: String,
    /// Download URL (may expire).
    pub url: String,
    /// Storage key used to mint a fresh URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Extracted text, when the file was converted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Ordered collection of file descriptors.
///
/// Callers index explicitly; there is no array/object duality.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Files(Vec<FileDescriptor>);

impl Files {
    /// Wrap a list of descriptors.
    pub fn new(files: Vec<FileDescriptor>) -> Self {
        Self(files)
    }

    /// First file, if any.
    pub fn first(&self) -> Option<&FileDescriptor> {
        self.0.first()
    }

    /// File at `index`.
    pub fn get(&self, index: usize) -> Option<&FileDescriptor> {
        self.0.get(index)
    }

    /// Extracted text of the file at `index`.
    pub fn text_of(&self, index: usize) -> Option<&str> {
        self.0.get(index).and_then(|f| f.text.as_deref())
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no files.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over descriptors.
    pub fn iter(&self) -> std::slice::Iter<'_, FileDescriptor> {
        self.0.iter()
    }

    /// Unwrap into the inner list.
    pub fn into_inner(self) -> Vec<FileDescriptor> {
        self.0
    }
}

impl<'a> IntoIterator for &'a Files {
    type Item = &'a FileDescriptor;
    type IntoIter = std::slice::Iter<'a, FileDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<FileDescriptor> for Files {
    fn from_iter<I: IntoIterator<Item = FileDescriptor>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Who produced an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    /// The AI agent (`bot_message`, or a recovered oversized payload).
    AiAgent,
    /// A human live-chat agent (`livechat_message`).
    Livechat,
    /// Synthetic error message (failed oversized-payload recovery).
    Error,
}

impl MessageOrigin {
    /// Wire tag for this origin.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AiAgent => "ai_agent",
            Self::Livechat => "livechat",
            Self::Error => "error",
        }
    }
}

/// A message delivered to `on_message` listeners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message content, verbatim.
    pub content: Value,
    /// Producer tag.
    pub origin: MessageOrigin,
    /// Conversation the message belongs to, when the frame named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Backend message id, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl InboundMessage {
    /// Build from a `bot_message` / `livechat_message` payload.
    pub fn from_payload(payload: &Value, origin: MessageOrigin) -> Self {
        Self {
            content: payload.get("content").cloned().unwrap_or(Value::Null),
            origin,
            conversation_id: payload
                .get("conversation_id")
                .and_then(Value::as_str)
                .map(String::from),
            message_id: payload
                .get("message_id")
                .and_then(Value::as_str)
                .map(String::from),
        }
    }

    /// Text body if the content is a string or a `{type: text}` object.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Value::String(s) => Some(s),
            Value::Object(map) => map.get("text").and_then(Value::as_str),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
