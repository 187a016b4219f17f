/// Insert-side row types. Reads come back as `courier_types::models` values.
use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_types::models::{
    Conversation, ConversationMetadata, ConversationType, MessageContent, NotificationType,
    ParticipantRole, RelatedData,
};

pub struct NewConversation {
    pub id: Uuid,
    pub conversation_type: ConversationType,
    /// Insertion order is preserved as participant position.
    pub participants: Vec<(Uuid, ParticipantRole)>,
    pub metadata: ConversationMetadata,
    pub created_at: DateTime<Utc>,
}

/// Result of inserting a pair conversation.
pub enum InsertOutcome {
    Inserted(Conversation),
    /// The pair already has a conversation. Someone else won the create race.
    Duplicate,
}

pub struct NewMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

pub struct NewNotification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub related_data: RelatedData,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a read acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// A receipt for this reader was recorded by this call.
    pub newly_read: bool,
    /// The message's delivery status moved to `read` in this call.
    pub status_advanced: bool,
    pub read_at: DateTime<Utc>,
}
