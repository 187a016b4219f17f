use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Conversation, ConversationType, Message, MessageContent, Notification,
};

// -- JWT Claims --

/// JWT claims shared across courier-api (REST middleware) and courier-gateway
/// (WebSocket authentication). Tokens are issued by the account service; this
/// workspace only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Conversations --

/// Either `participant_id` (pair conversation, deduplicated) or
/// `participant_ids` with `conversation_type = group`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub participant_id: Option<Uuid>,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
    pub conversation_type: Option<ConversationType>,
    pub job_id: Option<String>,
    pub application_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationResponse {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct ConversationPage {
    pub conversations: Vec<ConversationResponse>,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
}

// -- Messages --

/// `conversation_id` is optional: with only `receiver_id` the pair
/// conversation is resolved (or created) first.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub conversation_id: Option<Uuid>,
    pub receiver_id: Option<Uuid>,
    pub content: MessageContent,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct MarkedResponse {
    pub marked: usize,
}

// -- Notifications --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkNotificationsRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub unread_count: u64,
    pub page: u32,
    pub limit: u32,
}
