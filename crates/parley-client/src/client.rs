//! Client façade: one connection per credential, many conversations.

use std::sync::Arc;

use parley_core::constants::{inbound, outbound};
use parley_core::envelope::PayloadBuilder;
use parley_core::{ApiKey, ConversationId, ParleyError, Result, SocketId, UserId};
use parley_settings::ClientSettings;
use parley_transport::{Transport, TransportFactory, select_factory};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::conversation::{Conversation, DeleteOptions, bootstrap_content};
use crate::correlator::Correlator;
use crate::files::FileService;
use crate::http::HttpSideChannel;
use crate::registry::SessionRegistry;
use crate::send_path::{Confirmation, SendPath};
use crate::supervisor::{ConnectionState, ConnectionSupervisor};

/// Who speaks first in a new conversation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationMode {
    /// Wait for the user.
    #[default]
    UserFirst,
    /// The agent opens; the client sends an empty bootstrap message.
    BotFirst,
}

impl ConversationMode {
    /// Wire value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserFirst => "user-first",
            Self::BotFirst => "bot-first",
        }
    }
}

/// Optional fields of a new conversation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationOptions {
    /// Free-form user info.
    pub info: Option<Value>,
    /// Initial public metadata.
    pub metadata: Option<Value>,
    /// Who speaks first.
    pub mode: ConversationMode,
    /// Initial private metadata.
    pub private_metadata: Option<Value>,
}

/// Parameters of a user-conversation listing.
///
/// A query with only a user id takes the legacy path. Any filter entry,
/// limit, offset, or sort selects the advanced query path.
#[derive(Clone, Debug, PartialEq)]
pub struct UserConversationsQuery {
    /// Whose conversations.
    pub user_id: UserId,
    /// Backend-defined filter fields.
    pub filter: Map<String, Value>,
    /// Page size.
    pub limit: Option<u32>,
    /// Page offset.
    pub offset: Option<u32>,
    /// Backend-defined sort specification.
    pub sort: Option<Value>,
}

impl UserConversationsQuery {
    /// Legacy query for one user.
    pub fn for_user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            filter: Map::new(),
            limit: None,
            offset: None,
            sort: None,
        }
    }

    /// Add a filter entry.
    #[must_use]
    pub fn filter(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.filter.insert(key.into(), value);
        self
    }

    /// Set the page size.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the page offset.
    #[must_use]
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set the sort specification.
    #[must_use]
    pub fn sort(mut self, sort: Value) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Whether this query needs the advanced path.
    pub fn is_advanced(&self) -> bool {
        !self.filter.is_empty() || self.limit.is_some() || self.offset.is_some() || self.sort.is_some()
    }
}

impl From<UserId> for UserConversationsQuery {
    fn from(user_id: UserId) -> Self {
        Self::for_user(user_id)
    }
}

impl From<&str> for UserConversationsQuery {
    fn from(user_id: &str) -> Self {
        Self::for_user(user_id)
    }
}

/// One entry of a user-conversation listing, as the backend sent it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserConversation {
    /// Conversation id.
    pub conversation_id: ConversationId,
    /// Metadata snapshot.
    #[serde(default)]
    pub metadata: Value,
    /// Credential the conversation belongs to.
    #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// State shared by a client and its conversations.
pub(crate) struct ClientCore {
    pub(crate) api_key: ApiKey,
    pub(crate) settings: ClientSettings,
    pub(crate) supervisor: Arc<ConnectionSupervisor>,
    pub(crate) send_path: SendPath,
    pub(crate) http: HttpSideChannel,
    pub(crate) files: Option<Arc<dyn FileService>>,
    pub(crate) registry: SessionRegistry<Conversation>,
}

/// Builder for [`ParleyClient`].
pub struct ParleyClientBuilder {
    api_key: ApiKey,
    settings: ClientSettings,
    transport: Option<Arc<dyn TransportFactory>>,
    file_service: Option<Arc<dyn FileService>>,
    http_client: Option<reqwest::Client>,
}

impl ParleyClientBuilder {
    /// Use `settings` instead of the defaults.
    #[must_use]
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Inject a transport factory. Without one the native WebSocket
    /// transport is used.
    #[must_use]
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(factory);
        self
    }

    /// Attach a file service for file conversion and transcript link refresh.
    #[must_use]
    pub fn file_service(mut self, service: Arc<dyn FileService>) -> Self {
        self.file_service = Some(service);
        self
    }

    /// Use a preconfigured HTTP client for the side channel.
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Validate settings and assemble the client. Nothing is opened yet.
    pub fn build(self) -> Result<ParleyClient> {
        if self.api_key.expose().trim().is_empty() {
            return Err(ParleyError::validation("client", "API key must not be empty"));
        }
        self.settings
            .validate()
            .map_err(|e| ParleyError::validation("client settings", e.to_string()))?;
        let endpoints = self
            .settings
            .resolved_endpoints()
            .map_err(|e| ParleyError::validation("client settings", e.to_string()))?;

        let factory = select_factory(self.transport);
        debug!(transport = %factory.kind(), ws_url = %endpoints.ws_url, "building client");
        let supervisor = ConnectionSupervisor::new(endpoints.ws_url, factory, &self.settings);

        let http_client = match self.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| ParleyError::transport(format!("failed to build HTTP client: {e}")))?,
        };
        let http = HttpSideChannel::new(
            http_client,
            endpoints.http_url,
            self.api_key.clone(),
            self.settings.timeouts.http(),
        );
        let send_path = SendPath::new(Arc::clone(&supervisor), http.clone(), self.settings.delivery);

        let core = Arc::new(ClientCore {
            api_key: self.api_key,
            settings: self.settings,
            supervisor,
            send_path,
            http,
            files: self.file_service,
            registry: SessionRegistry::new(),
        });

        let weak = Arc::downgrade(&core);
        core.supervisor
            .set_on_connected(Arc::new(move |correlator: &Arc<Correlator>| {
                if let Some(core) = weak.upgrade() {
                    for conversation in core.registry.sessions() {
                        conversation.bind(correlator);
                    }
                }
            }));

        Ok(ParleyClient { core })
    }
}

/// Handle to one credential's connection and conversations. Cheap to clone.
#[derive(Clone)]
pub struct ParleyClient {
    core: Arc<ClientCore>,
}

impl ParleyClient {
    /// Start building a client for `api_key`.
    pub fn builder(api_key: impl Into<ApiKey>) -> ParleyClientBuilder {
        ParleyClientBuilder {
            api_key: api_key.into(),
            settings: ClientSettings::default(),
            transport: None,
            file_service: None,
            http_client: None,
        }
    }

    // ── Connection primitives (never guarded) ────────────────────────────

    /// Open the connection and wait for the backend handshake.
    pub async fn connect(&self) -> Result<SocketId> {
        self.core.supervisor.connect().await
    }

    /// Whether the connection is open.
    pub fn is_socket_active(&self) -> bool {
        self.core.supervisor.is_active()
    }

    /// Reconnect with the bounded retry policy.
    pub async fn reconnect(&self) -> Result<()> {
        self.core.supervisor.reconnect().await
    }

    /// Current transport handle.
    pub fn socket(&self) -> Option<Arc<dyn Transport>> {
        self.core.supervisor.socket()
    }

    // ── Conversations ────────────────────────────────────────────────────

    /// Start a conversation for `user_id` and wait for the backend to
    /// assign its id. Bot-first conversations also send an empty bootstrap
    /// message before returning.
    pub async fn create_conversation(
        &self,
        user_id: &UserId,
        options: ConversationOptions,
    ) -> Result<Arc<Conversation>> {
        const OPERATION: &str = "conversation start";
        if user_id.as_str().trim().is_empty() {
            return Err(ParleyError::validation(OPERATION, "user id must not be empty"));
        }
        for (name, value) in [
            ("info", &options.info),
            ("metadata", &options.metadata),
            ("private metadata", &options.private_metadata),
        ] {
            if value.as_ref().is_some_and(|v| !v.is_object()) {
                return Err(ParleyError::validation(OPERATION, format!("{name} must be an object")));
            }
        }

        let envelope = PayloadBuilder::new()
            .field("user_id", Value::String(user_id.to_string()))
            .optional("info", options.info)
            .optional("metadata", options.metadata.clone())
            .field("mode", Value::String(options.mode.as_str().to_string()))
            .optional("private_metadata", options.private_metadata)
            .into_envelope(outbound::CONVERSATION_START);
        let confirmation = Confirmation::new(
            inbound::CONVERSATION_START_SUCCESS,
            OPERATION,
            self.core.settings.timeouts.confirm(),
        )
        .echoed("user_id", user_id.as_str());

        let reply = self
            .core
            .send_path
            .guarded(OPERATION, self.core.send_path.confirm(envelope, confirmation))
            .await?;
        let id = reply
            .get("conversation_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(ConversationId::from)
            .ok_or_else(|| ParleyError::protocol("conversation_start_success without conversation_id"))?;

        let conversation = self.register(&id, options.metadata);
        info!(conversation_id = %id, user_id = %user_id, mode = options.mode.as_str(), "conversation started");
        if options.mode == ConversationMode::BotFirst {
            let _ = conversation.send_message(bootstrap_content()).await?;
        }
        Ok(conversation)
    }

    /// Handle for an existing conversation. Asking twice for the same id
    /// returns the same object.
    pub async fn get_conversation(&self, id: impl Into<ConversationId>) -> Result<Arc<Conversation>> {
        let id = id.into();
        if id.as_str().trim().is_empty() {
            return Err(ParleyError::validation("get conversation", "conversation id must not be empty"));
        }
        self.core
            .send_path
            .guarded("get conversation", async { Ok(self.register(&id, None)) })
            .await
    }

    /// List a user's conversations.
    pub async fn get_user_conversations(
        &self,
        query: impl Into<UserConversationsQuery>,
    ) -> Result<Vec<UserConversation>> {
        const OPERATION: &str = "get user conversations";
        let query = query.into();
        if query.user_id.as_str().trim().is_empty() {
            return Err(ParleyError::validation(OPERATION, "user id must not be empty"));
        }

        let payload = PayloadBuilder::new().field("user_id", Value::String(query.user_id.to_string()));
        let envelope = if query.is_advanced() {
            payload
                .optional(
                    "filter",
                    (!query.filter.is_empty()).then(|| Value::Object(query.filter.clone())),
                )
                .optional("limit", query.limit.map(Value::from))
                .optional("offset", query.offset.map(Value::from))
                .optional("sort", query.sort.clone())
                .into_envelope(outbound::QUERY_USER_CONVERSATIONS)
        } else {
            payload.into_envelope(outbound::GET_USER_CONVERSATIONS)
        };
        debug!(user_id = %query.user_id, event_type = envelope.event_type(), "listing user conversations");
        let confirmation = Confirmation::new(
            inbound::USER_CONVERSATIONS,
            OPERATION,
            self.core.settings.timeouts.confirm(),
        )
        .echoed("user_id", query.user_id.as_str());

        let reply = self
            .core
            .send_path
            .guarded(OPERATION, self.core.send_path.confirm(envelope, confirmation))
            .await?;
        parse_user_conversations(reply)
    }

    /// Delete every conversation of `user_id`.
    pub async fn delete_user_conversations(&self, user_id: &UserId, options: DeleteOptions) -> Result<()> {
        const OPERATION: &str = "delete user conversations";
        if user_id.as_str().trim().is_empty() {
            return Err(ParleyError::validation(OPERATION, "user id must not be empty"));
        }
        let envelope = PayloadBuilder::new()
            .field("user_id", Value::String(user_id.to_string()))
            .optional("soft_delete", options.soft_delete.map(Value::Bool))
            .into_envelope(outbound::DELETE_USER_CONVERSATIONS);
        let confirmation = Confirmation::new(
            inbound::DELETE_USER_CONVERSATIONS_SUCCESS,
            OPERATION,
            self.core.settings.timeouts.confirm(),
        )
        .echoed("user_id", user_id.as_str());
        let _ = self
            .core
            .send_path
            .guarded(OPERATION, self.core.send_path.confirm(envelope, confirmation))
            .await?;
        Ok(())
    }

    fn register(&self, id: &ConversationId, metadata: Option<Value>) -> Arc<Conversation> {
        let conversation = self.core.registry.get_or_create(id, || {
            Conversation::new(
                id.clone(),
                self.core.api_key.clone(),
                Arc::downgrade(&self.core),
                metadata,
            )
        });
        conversation.rebind();
        conversation
    }

    // ── Lifecycle and observation ────────────────────────────────────────

    /// Close the connection with the normal code. No reconnect follows.
    pub async fn close(&self) -> Result<()> {
        self.core.supervisor.close().await
    }

    /// Backend connection id from the last handshake.
    pub fn socket_id(&self) -> Option<SocketId> {
        self.core.supervisor.socket_id()
    }

    /// Connection lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.core.supervisor.state()
    }

    /// Observe transport generation changes.
    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.core.supervisor.watch_generation()
    }

    /// Credential this client authenticates with.
    pub fn api_key(&self) -> &ApiKey {
        &self.core.api_key
    }

    /// Settings the client was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.core.settings
    }

    /// The connection supervisor.
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.core.supervisor
    }

    /// Ids of every conversation handle this client holds.
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.core.registry.ids()
    }
}

fn parse_user_conversations(mut reply: Value) -> Result<Vec<UserConversation>> {
    let items = match reply.get_mut("conversations") {
        Some(list) => list.take(),
        None => reply,
    };
    if !items.is_array() {
        return Err(ParleyError::protocol("user_conversations reply is not a list"));
    }
    serde_json::from_value(items)
        .map_err(|e| ParleyError::protocol(format!("malformed user conversation entry: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
