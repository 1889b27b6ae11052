//! Conversation handle.
//!
//! A [`Conversation`] is the session object for one backend conversation id.
//! It never owns the connection; it holds a weak reference to the client core
//! and re-fetches the supervisor's current correlator whenever it needs one.
//!
//! Inbound delivery works through *bridge* listeners registered on the
//! correlator of the current transport generation. Each bridge filters by
//! `conversation_id` (frames without one are delivered to every bound
//! conversation) and fans out to the user's listeners. [`Conversation::rebind`]
//! attaches the bridges to the current correlator; it is idempotent per
//! generation, so repeated calls never duplicate delivery.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use parley_core::constants::{inbound, outbound};
use parley_core::content::{self, Files, InboundMessage, MessageOrigin};
use parley_core::envelope::{Envelope, PayloadBuilder, RemoteErrorEvent, payload_conversation_id};
use parley_core::{ApiKey, ConversationId, MessageId, ParleyError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::client::ClientCore;
use crate::correlator::Correlator;
use crate::files::{extract_missing_text, refresh_transcript_links};
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::send_path::Confirmation;

const MESSAGE: &str = "message";
const ACTION: &str = "action";
const UPDATE: &str = "conversation_update";
const ERROR: &str = "error";

/// Options for deleting a conversation. Forwarded to the backend as is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Backend-defined soft delete. Not interpreted client-side.
    pub soft_delete: Option<bool>,
}

impl DeleteOptions {
    /// Request a soft delete.
    pub fn soft() -> Self {
        Self {
            soft_delete: Some(true),
        }
    }

    fn apply(self, payload: PayloadBuilder) -> PayloadBuilder {
        payload.optional("soft_delete", self.soft_delete.map(Value::Bool))
    }
}

struct Binding {
    generation: u64,
    correlator: Weak<Correlator>,
    ids: Vec<ListenerId>,
}

impl Binding {
    fn detach(&self) {
        if let Some(correlator) = self.correlator.upgrade() {
            for id in &self.ids {
                let _ = correlator.remove_listener_id(*id);
            }
        }
    }
}

/// One conversation on a shared connection.
pub struct Conversation {
    id: ConversationId,
    api_key: ApiKey,
    core: Weak<ClientCore>,
    messages: ListenerRegistry<InboundMessage>,
    actions: ListenerRegistry<Value>,
    updates: ListenerRegistry<Value>,
    errors: ListenerRegistry<ParleyError>,
    metadata: Mutex<Option<Value>>,
    binding: Mutex<Option<Binding>>,
    me: Weak<Self>,
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl Conversation {
    pub(crate) fn new(
        id: ConversationId,
        api_key: ApiKey,
        core: Weak<ClientCore>,
        metadata: Option<Value>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            api_key,
            core,
            messages: ListenerRegistry::new(),
            actions: ListenerRegistry::new(),
            updates: ListenerRegistry::new(),
            errors: ListenerRegistry::new(),
            metadata: Mutex::new(metadata),
            binding: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Backend conversation id.
    pub fn get_conversation_id(&self) -> &ConversationId {
        &self.id
    }

    /// Credential that owns this conversation.
    pub fn api_key(&self) -> &ApiKey {
        &self.api_key
    }

    /// Last metadata snapshot seen by this handle.
    pub fn metadata(&self) -> Option<Value> {
        self.metadata.lock().clone()
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Send a user message. Fire-and-forget: resolves once the frame is
    /// handed to the transport. Returns the client-generated message id.
    pub async fn send_message(&self, content: Value) -> Result<MessageId> {
        if content.is_null() {
            return Err(ParleyError::validation("send message", "content must not be null"));
        }
        let core = self.core()?;
        let message_id = MessageId::generate();
        let envelope = PayloadBuilder::new()
            .conversation(&self.id)
            .message(&message_id)
            .field("content", content)
            .into_envelope(outbound::USER_MESSAGE);

        core.send_path
            .guarded("send message", async {
                self.rebind();
                core.send_path.fire(&envelope).await
            })
            .await?;
        debug!(conversation_id = %self.id, message_id = %message_id, "message sent");
        Ok(message_id)
    }

    /// Send files as a user message. Files without text are converted
    /// through the client's file service first, when one is configured.
    pub async fn send_files(&self, files: Files) -> Result<MessageId> {
        if files.is_empty() {
            return Err(ParleyError::validation("send files", "at least one file is required"));
        }
        let core = self.core()?;
        let files = match &core.files {
            Some(service) => extract_missing_text(files, service.as_ref()).await?,
            None => files,
        };
        self.send_message(json!({ "type": "files", "files": files })).await
    }

    /// Replace the conversation's public metadata. Confirmed.
    pub async fn set_metadata(&self, metadata: Value) -> Result<()> {
        let _ = self
            .update_metadata(metadata, outbound::UPDATE_METADATA, "metadata update")
            .await?;
        Ok(())
    }

    /// Replace the conversation's private metadata. Confirmed.
    pub async fn set_private_metadata(&self, metadata: Value) -> Result<()> {
        let _ = self
            .update_metadata(metadata, outbound::UPDATE_PRIVATE_METADATA, "private metadata update")
            .await?;
        Ok(())
    }

    async fn update_metadata(
        &self,
        metadata: Value,
        event_type: &'static str,
        operation: &'static str,
    ) -> Result<Value> {
        if !metadata.is_object() {
            return Err(ParleyError::validation(
                operation,
                "metadata must be a non-null object",
            ));
        }
        let core = self.core()?;
        let public = event_type == outbound::UPDATE_METADATA;
        let envelope = PayloadBuilder::new()
            .conversation(&self.id)
            .field("metadata", metadata.clone())
            .into_envelope(event_type);
        let confirmation = Confirmation::new(
            inbound::METADATA_UPDATE_SUCCESS,
            operation,
            core.settings.timeouts.metadata(),
        )
        .conversation(&self.id);

        let reply = core
            .send_path
            .guarded(operation, async {
                self.rebind();
                core.send_path.confirm(envelope, confirmation).await
            })
            .await?;
        if public {
            *self.metadata.lock() = Some(metadata);
        }
        Ok(reply)
    }

    /// Trigger an action. Fire-and-forget.
    pub async fn send_action(&self, action_id: &str, data: Option<Value>) -> Result<()> {
        let envelope = self.action_envelope(action_id, data)?;
        let core = self.core()?;
        core.send_path
            .guarded("send action", async {
                self.rebind();
                core.send_path.fire(&envelope).await
            })
            .await
    }

    /// Trigger an action and wait for the backend's `action` reply carrying
    /// the same action id.
    pub async fn send_action_with_response(&self, action_id: &str, data: Option<Value>) -> Result<Value> {
        let envelope = self.action_envelope(action_id, data)?;
        let core = self.core()?;
        let confirmation = Confirmation::new(inbound::ACTION, "action", core.settings.timeouts.confirm())
            .conversation(&self.id)
            .field("id", action_id);
        core.send_path
            .guarded("action", async {
                self.rebind();
                core.send_path.confirm(envelope, confirmation).await
            })
            .await
    }

    fn action_envelope(&self, action_id: &str, data: Option<Value>) -> Result<Envelope> {
        if action_id.trim().is_empty() {
            return Err(ParleyError::validation("send action", "action id must not be empty"));
        }
        Ok(PayloadBuilder::new()
            .conversation(&self.id)
            .field("id", Value::String(action_id.to_string()))
            .optional("data", data)
            .into_envelope(outbound::ACTION))
    }

    /// Fetch the conversation's metadata.
    pub async fn get_metadata(&self) -> Result<Value> {
        let mut reply = self
            .request(outbound::GET_METADATA, inbound::CONVERSATION_METADATA, "get metadata")
            .await?;
        let metadata = match reply.get_mut("metadata") {
            Some(m) => m.take(),
            None => reply,
        };
        *self.metadata.lock() = Some(metadata.clone());
        Ok(metadata)
    }

    /// Fetch the transcript. With a file service configured, expiring file
    /// links inside it are refreshed (best effort).
    pub async fn get_transcript(&self) -> Result<Value> {
        let mut reply = self
            .request(outbound::GET_TRANSCRIPT, inbound::CONVERSATION_TRANSCRIPT, "get transcript")
            .await?;
        let mut transcript = match reply.get_mut("transcript") {
            Some(t) => t.take(),
            None => reply,
        };
        let core = self.core()?;
        if let Some(service) = &core.files {
            let ttl = std::time::Duration::from_secs(core.settings.file_link_ttl_secs);
            let refreshed = refresh_transcript_links(&mut transcript, service.as_ref(), ttl).await;
            debug!(conversation_id = %self.id, refreshed, "transcript file links refreshed");
        }
        Ok(transcript)
    }

    async fn request(
        &self,
        event_type: &'static str,
        reply_type: &'static str,
        operation: &'static str,
    ) -> Result<Value> {
        let core = self.core()?;
        let envelope = PayloadBuilder::new()
            .conversation(&self.id)
            .into_envelope(event_type);
        let confirmation = Confirmation::new(reply_type, operation, core.settings.timeouts.confirm())
            .conversation(&self.id);
        core.send_path
            .guarded(operation, async {
                self.rebind();
                core.send_path.confirm(envelope, confirmation).await
            })
            .await
    }

    /// Replace the content of a message previously sent on this conversation.
    pub async fn edit_message(&self, message_id: &MessageId, content: Value) -> Result<()> {
        if message_id.as_str().is_empty() {
            return Err(ParleyError::validation("message edit", "message id must not be empty"));
        }
        if content.is_null() {
            return Err(ParleyError::validation("message edit", "content must not be null"));
        }
        let core = self.core()?;
        let envelope = PayloadBuilder::new()
            .conversation(&self.id)
            .message(message_id)
            .field("content", content)
            .into_envelope(outbound::EDIT_MESSAGE);
        let confirmation = Confirmation::new(
            inbound::MESSAGE_EDITED_SUCCESS,
            "message edit",
            core.settings.timeouts.confirm(),
        )
        .conversation(&self.id)
        .message(message_id);

        let _ = core
            .send_path
            .guarded("message edit", async {
                self.rebind();
                core.send_path.confirm(envelope, confirmation).await
            })
            .await?;
        Ok(())
    }

    /// Delete the conversation. On confirmation the handle is removed from
    /// the client's registry and stops receiving events.
    pub async fn delete(&self, options: DeleteOptions) -> Result<()> {
        let core = self.core()?;
        let envelope = options
            .apply(PayloadBuilder::new().conversation(&self.id))
            .into_envelope(outbound::DELETE_CONVERSATION);
        let confirmation = Confirmation::new(
            inbound::DELETE_CONVERSATION_SUCCESS,
            "delete conversation",
            core.settings.timeouts.confirm(),
        )
        .conversation(&self.id);

        let _ = core
            .send_path
            .guarded("delete conversation", async {
                core.send_path.confirm(envelope, confirmation).await
            })
            .await?;
        let _ = core.registry.remove(&self.id);
        self.unbind();
        debug!(conversation_id = %self.id, "conversation deleted");
        Ok(())
    }

    // ── Listeners ────────────────────────────────────────────────────────

    /// Called for every `bot_message` / `livechat_message` of this
    /// conversation, and for recovered oversized messages.
    pub fn on_message<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.messages.add(MESSAGE, Arc::new(callback));
        self.rebind();
        id
    }

    /// Called for every inbound `action` of this conversation.
    pub fn on_action_received<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.actions.add(ACTION, Arc::new(callback));
        self.rebind();
        id
    }

    /// Called for every `conversation_update` of this conversation.
    pub fn on_conversation_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.updates.add(UPDATE, Arc::new(callback));
        self.rebind();
        id
    }

    /// Called for backend `general_error` events addressed to this
    /// conversation (or to nobody in particular).
    pub fn on_error<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ParleyError) + Send + Sync + 'static,
    {
        let id = self.errors.add(ERROR, Arc::new(callback));
        self.rebind();
        id
    }

    /// Remove a listener registered through any `on_*` method.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.messages.remove_id(id)
            || self.actions.remove_id(id)
            || self.updates.remove_id(id)
            || self.errors.remove_id(id)
    }

    /// Number of user listeners across all kinds.
    pub fn listener_count(&self) -> usize {
        self.messages.total() + self.actions.total() + self.updates.total() + self.errors.total()
    }

    // ── Wiring ───────────────────────────────────────────────────────────

    /// Attach delivery to the connection's current transport generation.
    /// Safe to call any number of times.
    pub fn rebind(&self) {
        if let Some(core) = self.core.upgrade() {
            self.bind(&core.supervisor.correlator());
        }
    }

    /// Generation the bridges are attached to, if any.
    pub fn bound_generation(&self) -> Option<u64> {
        self.binding.lock().as_ref().map(|b| b.generation)
    }

    pub(crate) fn bind(&self, correlator: &Arc<Correlator>) {
        let mut binding = self.binding.lock();
        if let Some(current) = binding.as_ref() {
            let same = current
                .correlator
                .upgrade()
                .is_some_and(|c| Arc::ptr_eq(&c, correlator));
            if same {
                return;
            }
            current.detach();
        }

        let ids = vec![
            self.bridge(correlator, inbound::BOT_MESSAGE, |conv, payload| {
                conv.deliver_message(payload, MessageOrigin::AiAgent);
            }),
            self.bridge(correlator, inbound::LIVECHAT_MESSAGE, |conv, payload| {
                conv.deliver_message(payload, MessageOrigin::Livechat);
            }),
            self.bridge(correlator, inbound::ACTION, |conv, payload| {
                let _ = conv.actions.dispatch(ACTION, payload);
            }),
            self.bridge(correlator, inbound::CONVERSATION_UPDATE, |conv, payload| {
                let _ = conv.updates.dispatch(UPDATE, payload);
            }),
            self.bridge(correlator, inbound::GENERAL_ERROR, Self::deliver_error),
        ];
        debug!(conversation_id = %self.id, generation = correlator.generation(), "conversation bound");
        *binding = Some(Binding {
            generation: correlator.generation(),
            correlator: Arc::downgrade(correlator),
            ids,
        });
    }

    pub(crate) fn unbind(&self) {
        if let Some(binding) = self.binding.lock().take() {
            binding.detach();
        }
    }

    fn bridge(
        &self,
        correlator: &Correlator,
        event_type: &str,
        deliver: fn(&Self, &Value),
    ) -> ListenerId {
        let me = self.me.clone();
        correlator.add_listener(
            event_type,
            Arc::new(move |payload: &Value| {
                let Some(conv) = me.upgrade() else {
                    return;
                };
                if conv.accepts(payload) {
                    deliver(&conv, payload);
                }
            }),
        )
    }

    fn accepts(&self, payload: &Value) -> bool {
        payload_conversation_id(payload).is_none_or(|id| id == self.id.as_str())
    }

    fn deliver_message(&self, payload: &Value, origin: MessageOrigin) {
        let message = InboundMessage::from_payload(payload, origin);
        let _ = self.messages.dispatch(MESSAGE, &message);
    }

    fn deliver_error(&self, payload: &Value) {
        let event = RemoteErrorEvent::from_payload(payload);
        if event.is_oversize_with_link() {
            if let Some(link) = event.message_link {
                self.recover_oversize(link);
            }
            return;
        }
        let _ = self.errors.dispatch(ERROR, &event.into_error());
    }

    /// Fetch an oversized message out of band and deliver it to the message
    /// listeners as if it had arrived inline.
    fn recover_oversize(&self, link: String) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let me = self.me.clone();
        let conversation_id = self.id.to_string();
        debug!(conversation_id = %conversation_id, link = %link, "recovering oversized message");
        drop(tokio::spawn(async move {
            let message = match core.http.fetch_link(&link).await {
                Ok(body) => InboundMessage {
                    content: oversize_content(body),
                    origin: MessageOrigin::AiAgent,
                    conversation_id: Some(conversation_id),
                    message_id: None,
                },
                Err(e) => {
                    warn!(conversation_id = %conversation_id, error = %e, "oversized message fetch failed");
                    let failure = ParleyError::OversizeRecovery {
                        message: e.to_string(),
                    };
                    InboundMessage {
                        content: Value::String(format!("[{failure}]")),
                        origin: MessageOrigin::Error,
                        conversation_id: Some(conversation_id),
                        message_id: None,
                    }
                }
            };
            if let Some(conv) = me.upgrade() {
                let _ = conv.messages.dispatch(MESSAGE, &message);
            }
        }));
    }

    fn core(&self) -> Result<Arc<ClientCore>> {
        self.core.upgrade().ok_or(ParleyError::ConnectionDropped)
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.detach();
        }
    }
}

/// Content of an out-of-band payload: a full frame, a `{content}` object,
/// or the body itself.
fn oversize_content(mut body: Value) -> Value {
    if let Some(content) = body.pointer_mut("/event/event_payload/content") {
        return content.take();
    }
    if let Some(content) = body.get_mut("content") {
        return content.take();
    }
    body
}

/// Empty text message sent after a bot-first start.
pub(crate) fn bootstrap_content() -> Value {
    content::text("")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
