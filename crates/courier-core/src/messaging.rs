use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_db::models::NewMessage;
use courier_types::events::GatewayEvent;
use courier_types::models::{
    Conversation, ConversationType, DeliveryStatus, Message, MessageContent, NotificationType,
    PREVIEW_CHARS, RelatedData,
};

use crate::conversations::PairOptions;
use crate::error::{ChatError, ChatResult};
use crate::notifications::NotificationRequest;
use crate::{Courier, page_limit};

/// Longest text message accepted, in characters.
pub const MAX_TEXT_CHARS: usize = 5000;

/// A message as submitted by its author.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Target conversation. Without it the pair conversation with
    /// `receiver_id` is resolved or created.
    pub conversation_id: Option<Uuid>,
    pub receiver_id: Option<Uuid>,
    pub content: MessageContent,
    /// Echoed in the author's delivery acknowledgment.
    pub client_ref: Option<String>,
}

impl Courier {
    /// Persist a message, push it to connected recipients and record a
    /// notification for each of them.
    ///
    /// Returns once the message is durable (`sent`), or `delivered` if a
    /// recipient connection accepted it. Fails with `Timeout` if the write
    /// does not complete within the configured send timeout.
    pub async fn send_message(&self, sender: Uuid, outgoing: OutgoingMessage) -> ChatResult<Message> {
        let client_ref = outgoing.client_ref.clone();
        let (conversation, mut message) =
            tokio::time::timeout(self.inner.config.send_timeout, self.persist(sender, outgoing))
                .await
                .map_err(|_| {
                    warn!("Send from {} did not reach the store in time", sender);
                    ChatError::Timeout
                })??;

        let recipients = conversation.others(sender);
        let mut reached = false;
        for recipient in &recipients {
            let pushed = self
                .inner
                .dispatcher
                .send_to_user(*recipient, GatewayEvent::NewMessage { message: message.clone() })
                .await;
            reached |= pushed;
        }

        if reached {
            let id = message.id;
            match self
                .blocking(move |db| db.advance_delivery_status(id, DeliveryStatus::Delivered, Utc::now()))
                .await
            {
                Ok(true) => message.delivery_status = DeliveryStatus::Delivered,
                Ok(false) => {}
                // The message is durable; it simply stays `sent`.
                Err(e) => warn!("Could not mark {} delivered: {}", id, e),
            }
        }

        self.inner
            .dispatcher
            .send_to_user(
                sender,
                GatewayEvent::MessageDelivered {
                    message_id: message.id,
                    conversation_id: message.conversation_id,
                    status: message.delivery_status,
                    client_ref,
                },
            )
            .await;

        for recipient in recipients {
            let request = NotificationRequest {
                recipient_id: recipient,
                sender_id: Some(sender),
                notification_type: NotificationType::NewMessage,
                title: "New message".into(),
                message: message.content.preview(PREVIEW_CHARS),
                related_data: RelatedData {
                    message_id: Some(message.id),
                    conversation_id: Some(message.conversation_id),
                    job_id: conversation.metadata.job_id.clone(),
                    application_id: conversation.metadata.application_id.clone(),
                },
            };
            if let Err(e) = self.create_notification(request).await {
                warn!("Notification for message {} to {} not recorded: {}", message.id, recipient, e);
            }
        }

        debug!(
            "Message {} in {} is {}",
            message.id,
            message.conversation_id,
            message.delivery_status.as_str()
        );
        Ok(message)
    }

    /// Resolve the conversation, validate, and write. Everything before the
    /// `sent` boundary.
    async fn persist(&self, sender: Uuid, outgoing: OutgoingMessage) -> ChatResult<(Conversation, Message)> {
        let conversation = match (outgoing.conversation_id, outgoing.receiver_id) {
            (Some(conversation_id), _) => {
                let conversation = self
                    .blocking(move |db| db.get_conversation(conversation_id))
                    .await?
                    .ok_or_else(|| ChatError::InvalidConversation("conversation does not exist".into()))?;
                if !conversation.is_active_participant(sender) {
                    return Err(ChatError::Forbidden);
                }
                conversation
            }
            (None, Some(receiver)) => self.find_or_create(sender, receiver, PairOptions::default()).await?,
            (None, None) => {
                return Err(ChatError::InvalidConversation(
                    "conversation_id or receiver_id is required".into(),
                ));
            }
        };

        let receiver_id = match conversation.conversation_type {
            ConversationType::Group => None,
            _ => conversation.others(sender).first().copied(),
        };
        let new = NewMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender_id: sender,
            receiver_id,
            content: outgoing.content,
            created_at: Utc::now(),
        };

        if let Err(reason) = validate_content(&new.content) {
            warn!("Message from {} rejected: {}", sender, reason);
            let failed_id = new.id;
            if let Err(e) = self.blocking(move |db| db.insert_failed_message(&new)).await {
                warn!("Failed message {} could not be kept: {}", failed_id, e);
            }
            return Err(ChatError::InvalidMessage(reason));
        }

        let message = self.blocking(move |db| db.append_message(&new)).await?;
        Ok((conversation, message))
    }

    /// A chronological page of messages older than `before`. Messages from
    /// others that were still `sent` become `delivered` by being fetched.
    pub async fn get_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: Option<u32>,
    ) -> ChatResult<(Vec<Message>, bool)> {
        self.conversation_for(user_id, conversation_id).await?;
        let limit = page_limit(limit, 50);

        let mut messages = self
            .blocking(move |db| db.get_messages(conversation_id, user_id, before, limit + 1))
            .await?;
        let has_more = messages.len() > limit as usize;
        if has_more {
            messages.remove(0);
        }

        let pending: Vec<i64> = messages
            .iter()
            .filter(|m| m.sender_id != user_id && m.delivery_status == DeliveryStatus::Sent)
            .map(|m| m.seq)
            .collect();
        if !pending.is_empty() {
            let delivered = self
                .blocking(move |db| db.mark_fetched_delivered(conversation_id, user_id, &pending, Utc::now()))
                .await?;
            for (message_id, sender_id) in delivered {
                if let Some(m) = messages.iter_mut().find(|m| m.id == message_id) {
                    m.delivery_status = DeliveryStatus::Delivered;
                }
                self.inner
                    .dispatcher
                    .send_to_user(
                        sender_id,
                        GatewayEvent::MessageDelivered {
                            message_id,
                            conversation_id,
                            status: DeliveryStatus::Delivered,
                            client_ref: None,
                        },
                    )
                    .await;
            }
        }

        Ok((messages, has_more))
    }

    /// Acknowledge a message as read. Repeat acknowledgments are no-ops.
    pub async fn mark_read(&self, reader: Uuid, message_id: Uuid) -> ChatResult<Message> {
        let message = self.message_for(reader, message_id).await?;
        if message.sender_id == reader || message.delivery_status == DeliveryStatus::Failed {
            return Ok(message);
        }

        let outcome = self
            .blocking(move |db| db.record_read(message_id, reader, Utc::now()))
            .await?;
        if outcome.newly_read {
            self.inner
                .dispatcher
                .send_to_user(
                    message.sender_id,
                    GatewayEvent::MessageRead {
                        message_id,
                        conversation_id: message.conversation_id,
                        reader_id: reader,
                        read_at: outcome.read_at,
                    },
                )
                .await;
        }

        self.blocking(move |db| db.get_message(message_id))
            .await?
            .ok_or(ChatError::NotFound("message"))
    }

    /// Read everything from others in the conversation. Each affected
    /// sender is told once, about the newest message read.
    pub async fn mark_conversation_read(&self, reader: Uuid, conversation_id: Uuid) -> ChatResult<usize> {
        self.conversation_for(reader, conversation_id).await?;

        let newly_read = self
            .blocking(move |db| {
                let now = Utc::now();
                let mut newly_read = Vec::new();
                for (message_id, sender_id) in db.unread_messages_for(conversation_id, reader)? {
                    let outcome = db.record_read(message_id, reader, now)?;
                    if outcome.newly_read {
                        newly_read.push((message_id, sender_id, outcome.read_at));
                    }
                }
                Ok(newly_read)
            })
            .await?;

        let mut latest_per_sender = HashMap::new();
        for (message_id, sender_id, read_at) in &newly_read {
            latest_per_sender.insert(*sender_id, (*message_id, *read_at));
        }
        for (sender_id, (message_id, read_at)) in latest_per_sender {
            self.inner
                .dispatcher
                .send_to_user(
                    sender_id,
                    GatewayEvent::MessageRead {
                        message_id,
                        conversation_id,
                        reader_id: reader,
                        read_at,
                    },
                )
                .await;
        }

        Ok(newly_read.len())
    }

    /// Replace a text message's body. Only the author may edit.
    pub async fn edit_message(&self, user_id: Uuid, message_id: Uuid, text: String) -> ChatResult<Message> {
        let message = self.message_for(user_id, message_id).await?;
        if message.sender_id != user_id {
            return Err(ChatError::Forbidden);
        }
        if message.is_deleted {
            return Err(ChatError::InvalidMessage("message was deleted".into()));
        }
        if !matches!(message.content, MessageContent::Text { .. }) {
            return Err(ChatError::InvalidMessage("only text messages can be edited".into()));
        }
        let content = MessageContent::Text { text };
        validate_content(&content).map_err(ChatError::InvalidMessage)?;

        let edited = self
            .blocking(move |db| {
                db.edit_message(message_id, &content, Utc::now())?;
                db.get_message(message_id)
            })
            .await?
            .ok_or(ChatError::NotFound("message"))?;

        self.inner
            .dispatcher
            .broadcast(GatewayEvent::MessageEdited { message: edited.clone() });
        Ok(edited)
    }

    /// Tombstone a message. Only the author may delete; deleting twice is a no-op.
    pub async fn delete_message(&self, user_id: Uuid, message_id: Uuid) -> ChatResult<Message> {
        let message = self.message_for(user_id, message_id).await?;
        if message.sender_id != user_id {
            return Err(ChatError::Forbidden);
        }

        let (changed, deleted) = self
            .blocking(move |db| {
                let changed = db.tombstone_message(message_id, user_id, Utc::now())?;
                Ok((changed, db.get_message(message_id)?))
            })
            .await?;
        let deleted = deleted.ok_or(ChatError::NotFound("message"))?;

        if changed {
            info!("Message {} deleted by {}", message_id, user_id);
            self.inner.dispatcher.broadcast(GatewayEvent::MessageDeleted {
                message_id,
                conversation_id: deleted.conversation_id,
                deleted_by: user_id,
            });
        }
        Ok(deleted)
    }

    /// A message in a conversation the user actively participates in.
    async fn message_for(&self, user_id: Uuid, message_id: Uuid) -> ChatResult<Message> {
        let message = self
            .blocking(move |db| db.get_message(message_id))
            .await?
            .ok_or(ChatError::NotFound("message"))?;
        self.conversation_for(user_id, message.conversation_id).await?;
        // A failed message exists only for its author.
        if message.delivery_status == DeliveryStatus::Failed && message.sender_id != user_id {
            return Err(ChatError::NotFound("message"));
        }
        Ok(message)
    }
}

fn validate_content(content: &MessageContent) -> Result<(), String> {
    match content {
        MessageContent::Text { text } => {
            if text.trim().is_empty() {
                return Err("message text is empty".into());
            }
            if text.chars().count() > MAX_TEXT_CHARS {
                return Err(format!("message text exceeds {} characters", MAX_TEXT_CHARS));
            }
        }
        MessageContent::Image(file)
        | MessageContent::File(file)
        | MessageContent::Voice(file)
        | MessageContent::Video(file) => {
            if file.filename.trim().is_empty() || file.url.trim().is_empty() {
                return Err("attachment needs a filename and url".into());
            }
        }
        MessageContent::System { .. } => {
            return Err("system messages cannot be sent by users".into());
        }
    }
    Ok(())
}
