use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_db::models::NewNotification;
use courier_types::events::GatewayEvent;
use courier_types::models::{Notification, NotificationPreferences, NotificationType, RelatedData};

use crate::error::{ChatError, ChatResult};
use crate::mailer::EmailRequest;
use crate::{Courier, page_limit};

/// An event worth telling `recipient_id` about.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub recipient_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub related_data: RelatedData,
}

impl Courier {
    /// Record a notification, push it with the fresh unread count unless
    /// the recipient turned pushes off, and escalate to email when the
    /// recipient is offline and wants it.
    ///
    /// Only the write can fail the call. Push and email are best effort.
    pub async fn create_notification(&self, request: NotificationRequest) -> ChatResult<Notification> {
        if request.recipient_id.is_nil() {
            return Err(ChatError::InvalidParticipant("missing recipient".into()));
        }
        let now = Utc::now();
        let recipient = request.recipient_id;
        let new = NewNotification {
            id: Uuid::new_v4(),
            recipient_id: recipient,
            sender_id: request.sender_id,
            notification_type: request.notification_type,
            title: request.title,
            message: request.message,
            related_data: request.related_data,
            expires_at: request
                .notification_type
                .expires()
                .then(|| now + self.inner.config.announcement_ttl),
            created_at: now,
        };

        let (mut notification, unread_count, preferences) = self
            .blocking(move |db| {
                let notification = db.insert_notification(&new)?;
                let unread = db.unread_notification_count(recipient, Utc::now())?;
                let preferences = db.get_preferences(recipient)?;
                Ok((notification, unread, preferences))
            })
            .await?;

        let pushed = preferences.push
            && self
                .inner
                .dispatcher
                .send_to_user(
                    recipient,
                    GatewayEvent::NewNotification {
                        notification: notification.clone(),
                        unread_count,
                    },
                )
                .await;

        let wants_email = notification.notification_type.is_escalation_eligible()
            && preferences.email_immediate(notification.notification_type);
        if wants_email && !pushed && !self.inner.dispatcher.is_online(recipient).await {
            self.escalate(&mut notification).await;
        }

        Ok(notification)
    }

    /// One email attempt. The outcome is recorded; failure is only logged.
    async fn escalate(&self, notification: &mut Notification) {
        let recipient = notification.recipient_id;
        let address = match self.inner.directory.email_address(recipient).await {
            Ok(Some(address)) => address,
            Ok(None) => {
                warn!("No email address for {}, escalation skipped", recipient);
                return;
            }
            Err(e) => {
                warn!("Directory lookup for {} failed: {:#}", recipient, e);
                return;
            }
        };

        let mut params = BTreeMap::new();
        params.insert("title".to_string(), notification.title.clone());
        params.insert("message".to_string(), notification.message.clone());
        if let Some(conversation_id) = notification.related_data.conversation_id {
            params.insert("conversation_id".to_string(), conversation_id.to_string());
        }
        if let Some(job_id) = &notification.related_data.job_id {
            match self.inner.directory.job_title(job_id).await {
                Ok(Some(title)) => {
                    params.insert("job_title".to_string(), title);
                }
                Ok(None) => {}
                Err(e) => debug!("Job title for {} unavailable: {:#}", job_id, e),
            }
        }

        let email = EmailRequest {
            to: address,
            template: notification.notification_type.as_str().to_string(),
            params,
        };
        if let Err(e) = self.inner.mailer.send(&email).await {
            warn!("Email escalation for notification {} failed: {:#}", notification.id, e);
            return;
        }

        let id = notification.id;
        let sent_at = Utc::now();
        match self.blocking(move |db| db.record_email_sent(id, sent_at)).await {
            Ok(()) => {
                notification.email_sent = true;
                notification.email_sent_at = Some(sent_at);
                info!("Escalated notification {} to email", id);
            }
            Err(e) => warn!("Email for {} sent but not recorded: {}", id, e),
        }
    }

    pub async fn unread_count(&self, user_id: Uuid) -> ChatResult<u64> {
        self.blocking(move |db| db.unread_notification_count(user_id, Utc::now()))
            .await
    }

    /// Newest first, with the current unread count.
    pub async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> ChatResult<(Vec<Notification>, u64)> {
        let limit = page_limit(limit, 20);
        let offset = page.unwrap_or(1).max(1).saturating_sub(1).saturating_mul(limit);
        self.blocking(move |db| {
            let now = Utc::now();
            let notifications = db.list_notifications(user_id, unread_only, limit, offset, now)?;
            let unread = db.unread_notification_count(user_id, now)?;
            Ok((notifications, unread))
        })
        .await
    }

    /// Mark the caller's notifications read and return the fresh unread count.
    /// Any id that is not the caller's rejects the whole request.
    pub async fn mark_notifications_read(&self, user_id: Uuid, ids: Vec<Uuid>) -> ChatResult<u64> {
        let outcome = self
            .blocking(move |db| {
                let now = Utc::now();
                match db.mark_notifications_read(user_id, &ids, now)? {
                    Some(_) => Ok(Some(db.unread_notification_count(user_id, now)?)),
                    None => Ok(None),
                }
            })
            .await?;
        outcome.ok_or(ChatError::Forbidden)
    }

    pub async fn mark_all_notifications_read(&self, user_id: Uuid) -> ChatResult<u64> {
        self.blocking(move |db| {
            let now = Utc::now();
            db.mark_all_notifications_read(user_id, now)?;
            db.unread_notification_count(user_id, now)
        })
        .await
    }

    /// Delete one of the caller's notifications and return the fresh unread count.
    pub async fn delete_notification(&self, user_id: Uuid, id: Uuid) -> ChatResult<u64> {
        let outcome = self
            .blocking(move |db| {
                if !db.delete_notification(user_id, id)? {
                    return Ok(None);
                }
                Ok(Some(db.unread_notification_count(user_id, Utc::now())?))
            })
            .await?;
        outcome.ok_or(ChatError::NotFound("notification"))
    }

    pub async fn preferences(&self, user_id: Uuid) -> ChatResult<NotificationPreferences> {
        self.blocking(move |db| db.get_preferences(user_id)).await
    }

    pub async fn update_preferences(
        &self,
        user_id: Uuid,
        preferences: NotificationPreferences,
    ) -> ChatResult<NotificationPreferences> {
        self.blocking(move |db| {
            db.set_preferences(user_id, &preferences)?;
            Ok(preferences)
        })
        .await
    }

    /// Drop expired announcements. Run periodically by the server.
    pub async fn purge_expired_notifications(&self) -> ChatResult<usize> {
        self.blocking(|db| db.purge_expired_notifications(Utc::now())).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::StaticDirectory;
    use crate::testing::{RecordingMailer, courier};

    fn request(recipient: Uuid, kind: NotificationType) -> NotificationRequest {
        NotificationRequest {
            recipient_id: recipient,
            sender_id: None,
            notification_type: kind,
            title: "Title".into(),
            message: "Body".into(),
            related_data: RelatedData {
                job_id: Some("job-9".into()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn offline_recipient_is_emailed_once() {
        let user = Uuid::new_v4();
        let mailer = Arc::new(RecordingMailer::default());
        let courier = courier(
            mailer.clone(),
            StaticDirectory::default()
                .with_email(user, "user@example.com")
                .with_job("job-9", "Kitchen remodel"),
        );

        let n = courier.create_notification(request(user, NotificationType::NewMessage)).await.unwrap();
        assert!(n.email_sent);
        let sent = mailer.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "user@example.com");
        assert_eq!(sent[0].params.get("job_title").map(String::as_str), Some("Kitchen remodel"));

        // Job events are not escalation-eligible.
        let n = courier.create_notification(request(user, NotificationType::JobAccepted)).await.unwrap();
        assert!(!n.email_sent);
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn online_recipient_gets_push_not_email() {
        let user = Uuid::new_v4();
        let mailer = Arc::new(RecordingMailer::default());
        let courier = courier(mailer.clone(), StaticDirectory::default().with_email(user, "u@example.com"));
        let (_conn, mut rx) = courier.dispatcher().connect(user).await;

        let n = courier.create_notification(request(user, NotificationType::NewMessage)).await.unwrap();
        assert!(!n.email_sent);
        assert!(mailer.sent.lock().unwrap().is_empty());
        assert!(matches!(rx.recv().await, Some(GatewayEvent::NewNotification { unread_count: 1, .. })));
    }

    #[tokio::test]
    async fn email_failure_keeps_the_notification() {
        let user = Uuid::new_v4();
        let mailer = Arc::new(RecordingMailer { fail: true, ..Default::default() });
        let courier = courier(mailer, StaticDirectory::default().with_email(user, "u@example.com"));

        let n = courier.create_notification(request(user, NotificationType::NewMessage)).await.unwrap();
        assert!(!n.email_sent);
        assert_eq!(courier.unread_count(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn preferences_can_turn_email_off() {
        let user = Uuid::new_v4();
        let mailer = Arc::new(RecordingMailer::default());
        let courier = courier(mailer.clone(), StaticDirectory::default().with_email(user, "u@example.com"));
        courier
            .update_preferences(user, NotificationPreferences { email: true, push: true, messages: false, jobs: true })
            .await
            .unwrap();

        let n = courier.create_notification(request(user, NotificationType::NewMessage)).await.unwrap();
        assert!(!n.email_sent);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_preference_silences_the_live_channel() {
        let user = Uuid::new_v4();
        let mailer = Arc::new(RecordingMailer::default());
        let courier = courier(mailer.clone(), StaticDirectory::default().with_email(user, "u@example.com"));
        let (_conn, mut rx) = courier.dispatcher().connect(user).await;
        courier
            .update_preferences(user, NotificationPreferences { push: false, ..Default::default() })
            .await
            .unwrap();

        let n = courier.create_notification(request(user, NotificationType::NewMessage)).await.unwrap();
        assert!(rx.try_recv().is_err());
        // Still online, so no email either; the row waits in the inbox.
        assert!(!n.email_sent);
        assert!(mailer.sent.lock().unwrap().is_empty());
        assert_eq!(courier.unread_count(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unread_count_tracks_marks() {
        let courier = courier(Arc::new(RecordingMailer::default()), StaticDirectory::default());
        let user = Uuid::new_v4();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(courier.create_notification(request(user, NotificationType::JobApplication)).await.unwrap().id);
        }

        assert_eq!(courier.mark_notifications_read(user, ids[..1].to_vec()).await.unwrap(), 3);
        assert_eq!(courier.mark_notifications_read(user, ids[..1].to_vec()).await.unwrap(), 3);
        assert!(matches!(
            courier.mark_notifications_read(Uuid::new_v4(), ids.clone()).await,
            Err(ChatError::Forbidden)
        ));
        assert_eq!(courier.delete_notification(user, ids[1]).await.unwrap(), 2);
        assert!(matches!(courier.delete_notification(user, ids[1]).await, Err(ChatError::NotFound(_))));
        assert_eq!(courier.mark_all_notifications_read(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn announcements_expire() {
        let courier = courier(Arc::new(RecordingMailer::default()), StaticDirectory::default());
        let user = Uuid::new_v4();
        let n = courier
            .create_notification(request(user, NotificationType::SystemAnnouncement))
            .await
            .unwrap();
        let expires_at = n.expires_at.unwrap();
        assert_eq!(expires_at - n.created_at, courier.config().announcement_ttl);
    }
}
