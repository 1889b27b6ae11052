//! Wire-level constants: the envelope action, event-type discriminators,
//! and WebSocket close codes.

/// Envelope `action` for every outbound frame.
pub const SEND_MESSAGE_ACTION: &str = "sendMessage";

/// Header carrying the API credential on HTTP requests.
pub const API_KEY_HEADER: &str = "x-api-key";

/// WebSocket close code for a clean, intentional close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when a socket drops without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Inbound `general_error` code signalling an oversized payload that must be
/// fetched out-of-band from `message_link`.
pub const PAYLOAD_TOO_LARGE: u16 = 413;

/// Inbound event types.
pub mod inbound {
    /// Handshake acknowledgment carrying the backend `socket_id`.
    pub const SOCKET_CONNECTED: &str = "socket_connected";
    /// Reply to `conversation_start`.
    pub const CONVERSATION_START_SUCCESS: &str = "conversation_start_success";
    /// Message produced by the AI agent.
    pub const BOT_MESSAGE: &str = "bot_message";
    /// Message produced by a human live-chat agent.
    pub const LIVECHAT_MESSAGE: &str = "livechat_message";
    /// Action delivered to the conversation.
    pub const ACTION: &str = "action";
    /// Conversation-level state change.
    pub const CONVERSATION_UPDATE: &str = "conversation_update";
    /// Backend-reported failure.
    pub const GENERAL_ERROR: &str = "general_error";
    /// Reply to `update_metadata` / `update_private_metadata`.
    pub const METADATA_UPDATE_SUCCESS: &str = "metadata_update_success";
    /// Reply to `get_metadata`.
    pub const CONVERSATION_METADATA: &str = "conversation_metadata";
    /// Reply to `get_transcript`.
    pub const CONVERSATION_TRANSCRIPT: &str = "conversation_transcript";
    /// Reply to `edit_message`.
    pub const MESSAGE_EDITED_SUCCESS: &str = "message_edited_success";
    /// Reply to `delete_conversation`.
    pub const DELETE_CONVERSATION_SUCCESS: &str = "delete_conversation_success";
    /// Reply to `get_user_conversations` / `query_user_conversations`.
    pub const USER_CONVERSATIONS: &str = "user_conversations";
    /// Reply to `delete_user_conversations`.
    pub const DELETE_USER_CONVERSATIONS_SUCCESS: &str = "delete_user_conversations_success";
}

/// Outbound event types.
pub mod outbound {
    /// Start a new conversation for a user.
    pub const CONVERSATION_START: &str = "conversation_start";
    /// User-authored message.
    pub const USER_MESSAGE: &str = "user_message";
    /// Replace public conversation metadata.
    pub const UPDATE_METADATA: &str = "update_metadata";
    /// Replace private (backend-only) conversation metadata.
    pub const UPDATE_PRIVATE_METADATA: &str = "update_private_metadata";
    /// Trigger an action.
    pub const ACTION: &str = "action";
    /// Read conversation metadata.
    pub const GET_METADATA: &str = "get_metadata";
    /// Read the conversation transcript.
    pub const GET_TRANSCRIPT: &str = "get_transcript";
    /// Replace the content of an existing message.
    pub const EDIT_MESSAGE: &str = "edit_message";
    /// Delete the conversation.
    pub const DELETE_CONVERSATION: &str = "delete_conversation";
    /// List a user's conversations (legacy form).
    pub const GET_USER_CONVERSATIONS: &str = "get_user_conversations";
    /// List a user's conversations with filter/paging (advanced form).
    pub const QUERY_USER_CONVERSATIONS: &str = "query_user_conversations";
    /// Delete every conversation of a user.
    pub const DELETE_USER_CONVERSATIONS: &str = "delete_user_conversations";
}
