use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Conversation, DeliveryStatus, Message, MessageContent, Notification, PresenceStatus,
};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayEvent {
    /// Server confirms the connection is registered
    Ready { user_id: Uuid, username: String },

    /// A message was persisted for a conversation this user participates in
    NewMessage { message: Message },

    /// Sent back to the author once the message is durable. `status` is
    /// `delivered` if the recipient had a live connection, `sent` otherwise.
    MessageDelivered {
        message_id: Uuid,
        conversation_id: Uuid,
        status: DeliveryStatus,
        client_ref: Option<String>,
    },

    /// A recipient acknowledged a message
    MessageRead {
        message_id: Uuid,
        conversation_id: Uuid,
        reader_id: Uuid,
        read_at: DateTime<Utc>,
    },

    MessageEdited { message: Message },

    MessageDeleted {
        message_id: Uuid,
        conversation_id: Uuid,
        deleted_by: Uuid,
    },

    /// Summary fields or membership changed
    ConversationUpdated { conversation: Conversation },

    /// Someone left a group. Connections of the leaver drop the
    /// conversation channel when they see it.
    ParticipantLeft { conversation_id: Uuid, user_id: Uuid },

    UserTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserStoppedTyping { conversation_id: Uuid, user_id: Uuid },

    /// A user came online, changed status, or went offline
    UserStatusUpdated { user_id: Uuid, status: PresenceStatus },

    NewNotification {
        notification: Notification,
        unread_count: u64,
    },

    /// Reply to `get-online-users`
    OnlineUsers { users: Vec<OnlineUser> },

    /// A command from this connection could not be carried out
    Error {
        code: String,
        message: String,
        client_ref: Option<String>,
    },
}

impl GatewayEvent {
    /// Returns the conversation_id if this event belongs on a conversation channel.
    /// Events that return `None` are either targeted at a private channel or global.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::UserTyping { conversation_id, .. } => Some(*conversation_id),
            Self::UserStoppedTyping { conversation_id, .. } => Some(*conversation_id),
            Self::MessageEdited { message } => Some(message.conversation_id),
            Self::MessageDeleted { conversation_id, .. } => Some(*conversation_id),
            Self::ParticipantLeft { conversation_id, .. } => Some(*conversation_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_activity: DateTime<Utc>,
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayCommand {
    /// Persist and fan out a message. Either `conversation_id` or
    /// `receiver_id` must be present. `client_ref` is echoed back in the
    /// delivery acknowledgment so the client can match optimistic entries.
    SendMessage {
        conversation_id: Option<Uuid>,
        receiver_id: Option<Uuid>,
        content: MessageContent,
        client_ref: Option<String>,
    },

    /// Start receiving conversation-scoped events (typing, edits, deletes)
    JoinConversation { conversation_id: Uuid },

    LeaveConversation { conversation_id: Uuid },

    Typing { conversation_id: Uuid },

    StopTyping { conversation_id: Uuid },

    /// Acknowledge that a message was read
    MessageRead { message_id: Uuid },

    UpdateStatus { status: PresenceStatus },

    GetOnlineUsers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_kebab_case_tags() {
        let raw = r#"{"type":"join-conversation","data":{"conversation_id":"00000000-0000-0000-0000-000000000001"}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(cmd, GatewayCommand::JoinConversation { .. }));

        let cmd: GatewayCommand = serde_json::from_str(r#"{"type":"get-online-users"}"#).unwrap();
        assert!(matches!(cmd, GatewayCommand::GetOnlineUsers));
    }

    #[test]
    fn send_message_accepts_receiver_only() {
        let raw = r#"{"type":"send-message","data":{"receiver_id":"00000000-0000-0000-0000-000000000002","content":{"type":"text","text":"hi"}}}"#;
        match serde_json::from_str::<GatewayCommand>(raw).unwrap() {
            GatewayCommand::SendMessage { conversation_id, receiver_id, client_ref, .. } => {
                assert!(conversation_id.is_none());
                assert!(receiver_id.is_some());
                assert!(client_ref.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn typing_events_are_conversation_scoped() {
        let cid = Uuid::new_v4();
        let event = GatewayEvent::UserStoppedTyping { conversation_id: cid, user_id: Uuid::new_v4() };
        assert_eq!(event.conversation_id(), Some(cid));

        let status = GatewayEvent::UserStatusUpdated { user_id: Uuid::new_v4(), status: PresenceStatus::Away };
        assert_eq!(status.conversation_id(), None);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "user-status-updated");
    }
}
