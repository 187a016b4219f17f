use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use courier_types::models::{Notification, NotificationPreferences, NotificationType};

use crate::models::NewNotification;
use crate::{
    Database, OptionalExt, conversion_error, decode_enum, decode_ts, decode_uuid, encode_ts,
    placeholders,
};

const NOTIFICATION_COLUMNS: &str = "id, recipient_id, sender_id, notification_type, title, \
     message, related_data, is_read, read_at, email_sent, email_sent_at, expires_at, created_at";

/// Rows that have not expired as of `?2`.
const LIVE: &str = "(expires_at IS NULL OR expires_at > ?2)";

impl Database {
    pub fn insert_notification(&self, new: &NewNotification) -> Result<Notification> {
        let related = serde_json::to_string(&new.related_data)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO notifications
                    (id, recipient_id, sender_id, notification_type, title, message,
                     related_data, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.id.to_string(),
                    new.recipient_id.to_string(),
                    new.sender_id.map(|s| s.to_string()),
                    new.notification_type.as_str(),
                    new.title,
                    new.message,
                    related,
                    new.expires_at.as_ref().map(encode_ts),
                    encode_ts(&new.created_at),
                ],
            )?;
            Ok(())
        })?;

        Ok(Notification {
            id: new.id,
            recipient_id: new.recipient_id,
            sender_id: new.sender_id,
            notification_type: new.notification_type,
            title: new.title.clone(),
            message: new.message.clone(),
            related_data: new.related_data.clone(),
            read: false,
            read_at: None,
            email_sent: false,
            email_sent_at: None,
            expires_at: new.expires_at,
            created_at: new.created_at,
        })
    }

    pub fn get_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1");
            conn.query_row(&sql, [id.to_string()], notification_row).optional()
        })
    }

    /// Always computed from the table, never cached.
    pub fn unread_notification_count(&self, recipient_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| unread_count(conn, recipient_id, now))
    }

    /// Newest first, expired rows hidden.
    pub fn list_notifications(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
        limit: u32,
        offset: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let unread_filter = if unread_only { "AND is_read = 0" } else { "" };
            let sql = format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                  WHERE recipient_id = ?1 AND {LIVE} {unread_filter}
                  ORDER BY created_at DESC, id DESC
                  LIMIT ?3 OFFSET ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![recipient_id.to_string(), encode_ts(&now), limit, offset],
                    notification_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Mark the given notifications read for `recipient_id`.
    ///
    /// Returns `None` without touching anything if any id is missing or owned
    /// by someone else. Already-read rows are left alone.
    pub fn mark_notifications_read(
        &self,
        recipient_id: Uuid,
        ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Option<usize>> {
        if ids.is_empty() {
            return Ok(Some(0));
        }
        let mut unique: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        unique.sort();
        unique.dedup();

        self.with_tx(|tx| {
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
                vec![Box::new(recipient_id.to_string())];
            params.extend(
                unique
                    .iter()
                    .map(|id| Box::new(id.clone()) as Box<dyn rusqlite::types::ToSql>),
            );

            let sql = format!(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND id IN ({})",
                placeholders(2, unique.len())
            );
            let owned: i64 =
                tx.query_row(&sql, rusqlite::params_from_iter(params.iter()), |r| r.get(0))?;
            if owned as usize != unique.len() {
                return Ok(None);
            }

            params.push(Box::new(encode_ts(&now)));
            let sql = format!(
                "UPDATE notifications SET is_read = 1, read_at = ?{}
                  WHERE recipient_id = ?1 AND is_read = 0 AND id IN ({})",
                unique.len() + 2,
                placeholders(2, unique.len())
            );
            let changed = tx.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
            Ok(Some(changed))
        })
    }

    pub fn mark_all_notifications_read(&self, recipient_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET is_read = 1, read_at = ?2
                  WHERE recipient_id = ?1 AND is_read = 0",
                params![recipient_id.to_string(), encode_ts(&now)],
            )?;
            Ok(changed)
        })
    }

    /// Delete one of the recipient's notifications. Returns false when there
    /// was no such notification for this recipient.
    pub fn delete_notification(&self, recipient_id: Uuid, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM notifications WHERE id = ?1 AND recipient_id = ?2",
                params![id.to_string(), recipient_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn record_email_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE notifications SET email_sent = 1, email_sent_at = ?2
                  WHERE id = ?1 AND email_sent = 0",
                params![id.to_string(), encode_ts(&at)],
            )?;
            Ok(())
        })
    }

    /// Remove expired notifications. Returns how many rows were deleted.
    pub fn purge_expired_notifications(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let deleted = conn.execute(
                "DELETE FROM notifications WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [encode_ts(&now)],
            )?;
            Ok(deleted)
        })
    }

    // -- Preferences --

    pub fn get_preferences(&self, user_id: Uuid) -> Result<NotificationPreferences> {
        self.with_conn(|conn| {
            let prefs = conn
                .query_row(
                    "SELECT email, push, messages, jobs FROM notification_preferences
                      WHERE user_id = ?1",
                    [user_id.to_string()],
                    |row| {
                        Ok(NotificationPreferences {
                            email: row.get::<_, i64>(0)? != 0,
                            push: row.get::<_, i64>(1)? != 0,
                            messages: row.get::<_, i64>(2)? != 0,
                            jobs: row.get::<_, i64>(3)? != 0,
                        })
                    },
                )
                .optional()?;
            Ok(prefs.unwrap_or_default())
        })
    }

    pub fn set_preferences(&self, user_id: Uuid, prefs: &NotificationPreferences) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO notification_preferences (user_id, email, push, messages, jobs)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    email = excluded.email, push = excluded.push,
                    messages = excluded.messages, jobs = excluded.jobs",
                params![user_id.to_string(), prefs.email, prefs.push, prefs.messages, prefs.jobs],
            )?;
            Ok(())
        })
    }
}

fn unread_count(conn: &Connection, recipient_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0 AND {LIVE}"
    );
    let count: i64 =
        conn.query_row(&sql, params![recipient_id.to_string(), encode_ts(&now)], |r| r.get(0))?;
    Ok(count as u64)
}

fn notification_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let id: String = row.get(0)?;
    let recipient_id: String = row.get(1)?;
    let sender_id: Option<String> = row.get(2)?;
    let notification_type: String = row.get(3)?;
    let related: String = row.get(6)?;
    let read_at: Option<String> = row.get(8)?;
    let email_sent_at: Option<String> = row.get(10)?;
    let expires_at: Option<String> = row.get(11)?;

    Ok(Notification {
        id: decode_uuid(&id)?,
        recipient_id: decode_uuid(&recipient_id)?,
        sender_id: sender_id.as_deref().map(decode_uuid).transpose()?,
        notification_type: decode_enum(&notification_type, NotificationType::from_db)?,
        title: row.get(4)?,
        message: row.get(5)?,
        related_data: serde_json::from_str(&related).map_err(|e| conversion_error(&related, e))?,
        read: row.get::<_, i64>(7)? != 0,
        read_at: read_at.as_deref().map(decode_ts).transpose()?,
        email_sent: row.get::<_, i64>(9)? != 0,
        email_sent_at: email_sent_at.as_deref().map(decode_ts).transpose()?,
        expires_at: expires_at.as_deref().map(decode_ts).transpose()?,
        created_at: decode_ts(&row.get::<_, String>(12)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_types::models::RelatedData;

    fn notify(db: &Database, recipient: Uuid, kind: NotificationType) -> Notification {
        let now = Utc::now();
        db.insert_notification(&NewNotification {
            id: Uuid::new_v4(),
            recipient_id: recipient,
            sender_id: None,
            notification_type: kind,
            title: "title".into(),
            message: "body".into(),
            related_data: RelatedData::default(),
            expires_at: kind.expires().then(|| now + Duration::hours(1)),
            created_at: now,
        })
        .unwrap()
    }

    #[test]
    fn unread_count_is_total_minus_marked() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let ids: Vec<Uuid> = (0..5)
            .map(|_| notify(&db, user, NotificationType::JobApplication).id)
            .collect();

        assert_eq!(db.mark_notifications_read(user, &ids[..2], Utc::now()).unwrap(), Some(2));
        // Marking again is a no-op.
        assert_eq!(db.mark_notifications_read(user, &ids[..2], Utc::now()).unwrap(), Some(0));
        assert_eq!(db.unread_notification_count(user, Utc::now()).unwrap(), 3);

        assert_eq!(db.mark_all_notifications_read(user, Utc::now()).unwrap(), 3);
        assert_eq!(db.unread_notification_count(user, Utc::now()).unwrap(), 0);
    }

    #[test]
    fn foreign_ids_reject_the_whole_request() {
        let db = Database::open_in_memory().unwrap();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mine = notify(&db, alice, NotificationType::NewMessage);
        let theirs = notify(&db, bob, NotificationType::NewMessage);

        assert_eq!(db.mark_notifications_read(alice, &[mine.id, theirs.id], Utc::now()).unwrap(), None);
        assert_eq!(db.mark_notifications_read(alice, &[Uuid::new_v4()], Utc::now()).unwrap(), None);
        assert_eq!(db.unread_notification_count(alice, Utc::now()).unwrap(), 1);
        assert_eq!(db.unread_notification_count(bob, Utc::now()).unwrap(), 1);
    }

    #[test]
    fn expired_announcements_are_hidden_and_purged() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        notify(&db, user, NotificationType::SystemAnnouncement);
        notify(&db, user, NotificationType::NewMessage);

        let later = Utc::now() + Duration::hours(2);
        assert_eq!(db.unread_notification_count(user, Utc::now()).unwrap(), 2);
        assert_eq!(db.unread_notification_count(user, later).unwrap(), 1);
        assert_eq!(db.list_notifications(user, false, 10, 0, later).unwrap().len(), 1);

        assert_eq!(db.purge_expired_notifications(later).unwrap(), 1);
        assert_eq!(db.list_notifications(user, false, 10, 0, Utc::now()).unwrap().len(), 1);
    }

    #[test]
    fn delete_is_scoped_to_recipient() {
        let db = Database::open_in_memory().unwrap();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let n = notify(&db, alice, NotificationType::JobAccepted);

        assert!(!db.delete_notification(bob, n.id).unwrap());
        assert!(db.delete_notification(alice, n.id).unwrap());
        assert!(db.get_notification(n.id).unwrap().is_none());
    }

    #[test]
    fn email_outcome_is_recorded() {
        let db = Database::open_in_memory().unwrap();
        let n = notify(&db, Uuid::new_v4(), NotificationType::NewMessage);
        db.record_email_sent(n.id, Utc::now()).unwrap();

        let stored = db.get_notification(n.id).unwrap().unwrap();
        assert!(stored.email_sent);
        assert!(stored.email_sent_at.is_some());
    }

    #[test]
    fn preferences_default_then_persist() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        assert_eq!(db.get_preferences(user).unwrap(), NotificationPreferences::default());

        let prefs = NotificationPreferences { email: false, push: true, messages: true, jobs: false };
        db.set_preferences(user, &prefs).unwrap();
        assert_eq!(db.get_preferences(user).unwrap(), prefs);
    }
}
