use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Conversations --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Project,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Project => "project",
            Self::Group => "group",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "project" => Some(Self::Project),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    /// Pair conversations are the ones bound by the one-pair-one-conversation rule.
    pub fn is_pair(&self) -> bool {
        !matches!(self, Self::Group)
    }

    /// Ordering used when two conversations are consolidated: the richer type survives.
    pub fn richness(&self) -> u8 {
        match self {
            Self::Direct => 0,
            Self::Project => 1,
            Self::Group => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Admin,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            _ => Self::Member,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Denormalized copy of the newest message, refreshed on every append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub message_id: Uuid,
    pub preview: String,
    pub sender_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
}

/// Links into the job marketplace. Opaque to this service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub job_id: Option<String>,
    pub application_id: Option<String>,
}

impl ConversationMetadata {
    /// Fill fields this metadata lacks from `other`. Existing values are kept.
    pub fn merged_with(&self, other: &ConversationMetadata) -> ConversationMetadata {
        ConversationMetadata {
            job_id: self.job_id.clone().or_else(|| other.job_id.clone()),
            application_id: self
                .application_id
                .clone()
                .or_else(|| other.application_id.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total_messages: u64,
    pub last_activity: DateTime<Utc>,
    pub participant_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub conversation_type: ConversationType,
    pub participants: Vec<Participant>,
    pub last_message: Option<LastMessage>,
    pub metadata: ConversationMetadata,
    pub stats: ConversationStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_active_participant(&self, user_id: Uuid) -> bool {
        self.participants
            .iter()
            .any(|p| p.user_id == user_id && p.is_active)
    }

    pub fn active_participant_ids(&self) -> Vec<Uuid> {
        self.participants
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.user_id)
            .collect()
    }

    /// Every active participant except `user_id`.
    pub fn others(&self, user_id: Uuid) -> Vec<Uuid> {
        self.active_participant_ids()
            .into_iter()
            .filter(|id| *id != user_id)
            .collect()
    }
}

// -- Messages --

/// Length of the `lastMessage` preview cached on a conversation.
pub const PREVIEW_CHARS: usize = 100;

/// Preview shown in place of a tombstoned message.
pub const DELETED_PREVIEW: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    File,
    System,
    Voice,
    Video,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            "voice" => Some(Self::Voice),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub filename: String,
    pub mimetype: String,
    pub size: u64,
    pub url: String,
}

/// Message payload, keyed by message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Image(FileDescriptor),
    File(FileDescriptor),
    Voice(FileDescriptor),
    Video(FileDescriptor),
    System { code: String, text: String },
}

impl MessageContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::Text,
            Self::Image(_) => MessageType::Image,
            Self::File(_) => MessageType::File,
            Self::Voice(_) => MessageType::Voice,
            Self::Video(_) => MessageType::Video,
            Self::System { .. } => MessageType::System,
        }
    }

    /// Short human-readable summary for conversation lists and emails.
    pub fn preview(&self, max_chars: usize) -> String {
        let full = match self {
            Self::Text { text } => text.clone(),
            Self::System { text, .. } => text.clone(),
            Self::Image(f) | Self::File(f) | Self::Voice(f) | Self::Video(f) => {
                format!("[{}] {}", self.message_type().as_str(), f.filename)
            }
        };

        if full.chars().count() <= max_chars {
            full
        } else {
            let mut cut: String = full.chars().take(max_chars).collect();
            cut.push('…');
            cut
        }
    }
}

/// Delivery lifecycle: sending -> sent -> delivered -> read, with `failed`
/// reachable only from sending or sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 0,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (Self::Failed, _) => false,
            (Self::Sending | Self::Sent, Self::Failed) => true,
            (_, Self::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// States from which `next` is reachable. Used to build guarded updates.
    pub fn predecessors(next: DeliveryStatus) -> Vec<DeliveryStatus> {
        [Self::Sending, Self::Sent, Self::Delivered, Self::Read, Self::Failed]
            .into_iter()
            .filter(|s| s.can_advance_to(next))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    pub content: MessageContent,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// Store-assigned, monotonically increasing. Authoritative order.
    pub seq: i64,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub content: MessageContent,
    pub delivery_status: DeliveryStatus,
    pub read_by: Vec<ReadReceipt>,
    pub is_edited: bool,
    pub edit_history: Vec<EditRecord>,
    pub is_deleted: bool,
    pub deleted_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.content.message_type()
    }
}

// -- Notifications --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    NewMessage,
    JobApplication,
    JobAccepted,
    JobRejected,
    JobCompleted,
    PaymentReceived,
    ReviewReceived,
    SystemAnnouncement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationCategory {
    Messages,
    Jobs,
    System,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::JobApplication => "job_application",
            Self::JobAccepted => "job_accepted",
            Self::JobRejected => "job_rejected",
            Self::JobCompleted => "job_completed",
            Self::PaymentReceived => "payment_received",
            Self::ReviewReceived => "review_received",
            Self::SystemAnnouncement => "system_announcement",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "new_message" => Some(Self::NewMessage),
            "job_application" => Some(Self::JobApplication),
            "job_accepted" => Some(Self::JobAccepted),
            "job_rejected" => Some(Self::JobRejected),
            "job_completed" => Some(Self::JobCompleted),
            "payment_received" => Some(Self::PaymentReceived),
            "review_received" => Some(Self::ReviewReceived),
            "system_announcement" => Some(Self::SystemAnnouncement),
            _ => None,
        }
    }

    pub fn category(&self) -> NotificationCategory {
        match self {
            Self::NewMessage => NotificationCategory::Messages,
            Self::SystemAnnouncement => NotificationCategory::System,
            _ => NotificationCategory::Jobs,
        }
    }

    /// Only new messages are escalated to email immediately.
    pub fn is_escalation_eligible(&self) -> bool {
        matches!(self, Self::NewMessage)
    }

    pub fn expires(&self) -> bool {
        matches!(self, Self::SystemAnnouncement)
    }
}

/// Client-side routing hints. Passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub related_data: RelatedData,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub email_sent: bool,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub email: bool,
    pub push: bool,
    pub messages: bool,
    pub jobs: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            email: true,
            push: true,
            messages: true,
            jobs: true,
        }
    }
}

impl NotificationPreferences {
    /// Whether a notification of this type should be emailed right away.
    pub fn email_immediate(&self, notification_type: NotificationType) -> bool {
        if !self.email {
            return false;
        }
        match notification_type.category() {
            NotificationCategory::Messages => self.messages,
            NotificationCategory::Jobs => self.jobs,
            NotificationCategory::System => true,
        }
    }
}

// -- Presence --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_status_only_moves_forward() {
        use DeliveryStatus::*;

        assert!(Sending.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Sent.can_advance_to(Read));
        assert!(Delivered.can_advance_to(Read));

        assert!(!Read.can_advance_to(Sent));
        assert!(!Read.can_advance_to(Delivered));
        assert!(!Read.can_advance_to(Read));
        assert!(!Delivered.can_advance_to(Sent));
    }

    #[test]
    fn failed_is_terminal_and_only_reachable_before_delivery() {
        use DeliveryStatus::*;

        assert!(Sending.can_advance_to(Failed));
        assert!(Sent.can_advance_to(Failed));
        assert!(!Delivered.can_advance_to(Failed));
        assert!(!Read.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Sent));
        assert!(!Failed.can_advance_to(Read));

        assert_eq!(DeliveryStatus::predecessors(Read), vec![Sending, Sent, Delivered]);
        assert_eq!(DeliveryStatus::predecessors(Failed), vec![Sending, Sent]);
    }

    #[test]
    fn preview_truncates_long_text_and_labels_files() {
        let text = MessageContent::Text { text: "a".repeat(120) };
        let preview = text.preview(100);
        assert_eq!(preview.chars().count(), 101);
        assert!(preview.ends_with('…'));

        let file = MessageContent::File(FileDescriptor {
            filename: "brief.pdf".into(),
            mimetype: "application/pdf".into(),
            size: 2048,
            url: "https://files.example/brief.pdf".into(),
        });
        assert_eq!(file.preview(100), "[file] brief.pdf");
    }

    #[test]
    fn content_is_tagged_by_type() {
        let json = serde_json::json!({ "type": "image", "filename": "a.png", "mimetype": "image/png", "size": 10, "url": "u" });
        let content: MessageContent = serde_json::from_value(json).unwrap();
        assert_eq!(content.message_type(), MessageType::Image);
    }

    #[test]
    fn metadata_merge_keeps_existing_values() {
        let survivor = ConversationMetadata { job_id: Some("job-1".into()), application_id: None };
        let other = ConversationMetadata { job_id: Some("job-2".into()), application_id: Some("app-9".into()) };
        let merged = survivor.merged_with(&other);
        assert_eq!(merged.job_id.as_deref(), Some("job-1"));
        assert_eq!(merged.application_id.as_deref(), Some("app-9"));
    }

    #[test]
    fn email_immediate_respects_category_switches() {
        let prefs = NotificationPreferences { messages: false, ..Default::default() };
        assert!(!prefs.email_immediate(NotificationType::NewMessage));
        assert!(prefs.email_immediate(NotificationType::JobAccepted));

        let off = NotificationPreferences { email: false, ..Default::default() };
        assert!(!off.email_immediate(NotificationType::JobAccepted));
    }
}
