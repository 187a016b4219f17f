use std::collections::HashMap;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use courier_types::models::{
    DELETED_PREVIEW, DeliveryStatus, EditRecord, Message, MessageContent, PREVIEW_CHARS,
    ReadReceipt,
};

use crate::models::{NewMessage, ReadOutcome};
use crate::{
    Database, OptionalExt, conversion_error, decode_enum, decode_ts, decode_uuid, encode_ts,
    placeholders,
};

const MESSAGE_COLUMNS: &str = "seq, id, conversation_id, sender_id, receiver_id, content, \
     delivery_status, is_edited, is_deleted, deleted_by, created_at, updated_at";

impl Database {
    // -- Appends --

    /// Persist a message as `sent` and refresh the conversation summary in the
    /// same transaction. The returned message is the committed row.
    pub fn append_message(&self, new: &NewMessage) -> Result<Message> {
        let content = serde_json::to_string(&new.content)?;
        let created = encode_ts(&new.created_at);

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO messages
                    (id, conversation_id, sender_id, receiver_id, message_type, content,
                     delivery_status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    new.id.to_string(),
                    new.conversation_id.to_string(),
                    new.sender_id.to_string(),
                    new.receiver_id.map(|r| r.to_string()),
                    new.content.message_type().as_str(),
                    content,
                    DeliveryStatus::Sent.as_str(),
                    created,
                ],
            )?;
            let seq = tx.last_insert_rowid();

            // Atomic increment, never read-modify-write.
            let updated = tx.execute(
                "UPDATE conversations
                    SET total_messages = total_messages + 1,
                        last_message_id = ?1,
                        last_message_preview = ?2,
                        last_message_sender_id = ?3,
                        last_message_at = ?4,
                        last_message_type = ?5,
                        last_activity = ?4,
                        updated_at = ?4
                  WHERE id = ?6",
                params![
                    new.id.to_string(),
                    new.content.preview(PREVIEW_CHARS),
                    new.sender_id.to_string(),
                    created,
                    new.content.message_type().as_str(),
                    new.conversation_id.to_string(),
                ],
            )?;
            if updated == 0 {
                bail!("conversation {} does not exist", new.conversation_id);
            }

            Ok(committed(seq, new, DeliveryStatus::Sent))
        })
    }

    /// Keep a message that failed validation so the client can offer a resend.
    /// Failed messages never touch the conversation summary.
    pub fn insert_failed_message(&self, new: &NewMessage) -> Result<Message> {
        let content = serde_json::to_string(&new.content)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages
                    (id, conversation_id, sender_id, receiver_id, message_type, content,
                     delivery_status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    new.id.to_string(),
                    new.conversation_id.to_string(),
                    new.sender_id.to_string(),
                    new.receiver_id.map(|r| r.to_string()),
                    new.content.message_type().as_str(),
                    content,
                    DeliveryStatus::Failed.as_str(),
                    encode_ts(&new.created_at),
                ],
            )?;
            Ok(committed(conn.last_insert_rowid(), new, DeliveryStatus::Failed))
        })
    }

    // -- Reads --

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
            let row = conn.query_row(&sql, [id.to_string()], message_row).optional()?;
            match row {
                Some(message) => Ok(Some(attach_receipts(conn, vec![message])?.remove(0))),
                None => Ok(None),
            }
        })
    }

    /// A page of messages older than `before` (a seq cursor), returned in
    /// chronological order. Failed messages are only visible to their sender.
    pub fn get_messages(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                  WHERE conversation_id = ?1 AND seq < ?2
                    AND (delivery_status != 'failed' OR sender_id = ?4)
                  ORDER BY seq DESC
                  LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(
                    params![
                        conversation_id.to_string(),
                        before.unwrap_or(i64::MAX),
                        limit,
                        viewer.to_string()
                    ],
                    message_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            attach_receipts(conn, rows)
        })
    }

    pub fn count_messages(&self, conversation_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                  WHERE conversation_id = ?1 AND delivery_status != 'failed'",
                [conversation_id.to_string()],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // -- Delivery state --

    /// Move a message forward to `next`. Returns false when the message is
    /// already at or past `next`; the guard lives in the UPDATE itself.
    pub fn advance_delivery_status(
        &self,
        id: Uuid,
        next: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| advance_status(conn, id, next, now))
    }

    /// Messages from others in `seqs` that are still `sent` become
    /// `delivered`. Returns the (message, sender) pairs that changed.
    pub fn mark_fetched_delivered(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        seqs: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, Uuid)>> {
        if seqs.is_empty() {
            return Ok(vec![]);
        }
        self.with_tx(|tx| {
            let sql = format!(
                "SELECT id, sender_id FROM messages
                  WHERE conversation_id = ?1 AND sender_id != ?2 AND delivery_status = 'sent'
                    AND seq IN ({})",
                placeholders(3, seqs.len())
            );
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
                Box::new(conversation_id.to_string()),
                Box::new(recipient_id.to_string()),
            ];
            params.extend(seqs.iter().map(|s| Box::new(*s) as Box<dyn rusqlite::types::ToSql>));

            let mut stmt = tx.prepare(&sql)?;
            let changed = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    let id: String = row.get(0)?;
                    let sender: String = row.get(1)?;
                    Ok((decode_uuid(&id)?, decode_uuid(&sender)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (id, _) in &changed {
                advance_status(tx, *id, DeliveryStatus::Delivered, now)?;
            }
            Ok(changed)
        })
    }

    /// Record that `reader_id` read the message. Idempotent: a second
    /// acknowledgment neither adds a receipt nor moves the status.
    pub fn record_read(
        &self,
        message_id: Uuid,
        reader_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReadOutcome> {
        self.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
                params![message_id.to_string(), reader_id.to_string(), encode_ts(&now)],
            )?;
            let read_at: String = tx.query_row(
                "SELECT read_at FROM message_reads WHERE message_id = ?1 AND user_id = ?2",
                params![message_id.to_string(), reader_id.to_string()],
                |r| r.get(0),
            )?;
            let status_advanced = advance_status(tx, message_id, DeliveryStatus::Read, now)?;

            Ok(ReadOutcome {
                newly_read: inserted > 0,
                status_advanced,
                read_at: decode_ts(&read_at)?,
            })
        })
    }

    /// Ids and senders of messages from others the reader has not read yet.
    pub fn unread_messages_for(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> Result<Vec<(Uuid, Uuid)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.sender_id FROM messages m
                  WHERE m.conversation_id = ?1
                    AND m.sender_id != ?2
                    AND m.is_deleted = 0
                    AND m.delivery_status != 'failed'
                    AND NOT EXISTS (SELECT 1 FROM message_reads r
                                     WHERE r.message_id = m.id AND r.user_id = ?2)
                  ORDER BY m.seq",
            )?;
            let rows = stmt
                .query_map(params![conversation_id.to_string(), reader_id.to_string()], |row| {
                    let id: String = row.get(0)?;
                    let sender: String = row.get(1)?;
                    Ok((decode_uuid(&id)?, decode_uuid(&sender)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Soft mutations --

    /// Replace the content, keeping the previous version in the edit history.
    pub fn edit_message(
        &self,
        id: Uuid,
        content: &MessageContent,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let encoded = serde_json::to_string(content)?;
        let now = encode_ts(&now);
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO message_edits (message_id, content, edited_at)
                 SELECT id, content, ?2 FROM messages WHERE id = ?1",
                params![id.to_string(), now],
            )?;
            tx.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), encoded, now],
            )?;
            tx.execute(
                "UPDATE conversations SET last_message_preview = ?2
                  WHERE last_message_id = ?1",
                params![id.to_string(), content.preview(PREVIEW_CHARS)],
            )?;
            Ok(())
        })
    }

    /// Tombstone a message. Content stays in the row. Returns false if it was
    /// already deleted.
    pub fn tombstone_message(&self, id: Uuid, deleted_by: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let now = encode_ts(&now);
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE messages SET is_deleted = 1, deleted_by = ?2, updated_at = ?3
                  WHERE id = ?1 AND is_deleted = 0",
                params![id.to_string(), deleted_by.to_string(), now],
            )?;
            if changed > 0 {
                tx.execute(
                    "UPDATE conversations SET last_message_preview = ?2
                      WHERE last_message_id = ?1",
                    params![id.to_string(), DELETED_PREVIEW],
                )?;
            }
            Ok(changed > 0)
        })
    }
}

fn advance_status(
    conn: &Connection,
    id: Uuid,
    next: DeliveryStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    let allowed = DeliveryStatus::predecessors(next);
    if allowed.is_empty() {
        return Ok(false);
    }
    let sql = format!(
        "UPDATE messages SET delivery_status = ?1, updated_at = ?2
          WHERE id = ?3 AND delivery_status IN ({})",
        placeholders(4, allowed.len())
    );
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(next.as_str()),
        Box::new(encode_ts(&now)),
        Box::new(id.to_string()),
    ];
    params.extend(
        allowed
            .iter()
            .map(|s| Box::new(s.as_str()) as Box<dyn rusqlite::types::ToSql>),
    );
    let changed = conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
    Ok(changed > 0)
}

fn committed(seq: i64, new: &NewMessage, status: DeliveryStatus) -> Message {
    Message {
        id: new.id,
        seq,
        conversation_id: new.conversation_id,
        sender_id: new.sender_id,
        receiver_id: new.receiver_id,
        content: new.content.clone(),
        delivery_status: status,
        read_by: vec![],
        is_edited: false,
        edit_history: vec![],
        is_deleted: false,
        deleted_by: None,
        created_at: new.created_at,
        updated_at: new.created_at,
    }
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(1)?;
    let conversation_id: String = row.get(2)?;
    let sender_id: String = row.get(3)?;
    let receiver_id: Option<String> = row.get(4)?;
    let content: String = row.get(5)?;
    let status: String = row.get(6)?;
    let deleted_by: Option<String> = row.get(9)?;

    Ok(Message {
        id: decode_uuid(&id)?,
        seq: row.get(0)?,
        conversation_id: decode_uuid(&conversation_id)?,
        sender_id: decode_uuid(&sender_id)?,
        receiver_id: receiver_id.as_deref().map(decode_uuid).transpose()?,
        content: serde_json::from_str(&content).map_err(|e| conversion_error(&content, e))?,
        delivery_status: decode_enum(&status, DeliveryStatus::from_db)?,
        read_by: vec![],
        is_edited: row.get::<_, i64>(7)? != 0,
        edit_history: vec![],
        is_deleted: row.get::<_, i64>(8)? != 0,
        deleted_by: deleted_by.as_deref().map(decode_uuid).transpose()?,
        created_at: decode_ts(&row.get::<_, String>(10)?)?,
        updated_at: decode_ts(&row.get::<_, String>(11)?)?,
    })
}

/// Batch-fetch read receipts and edit history for a set of messages.
fn attach_receipts(conn: &Connection, mut messages: Vec<Message>) -> Result<Vec<Message>> {
    if messages.is_empty() {
        return Ok(messages);
    }

    let ids: Vec<String> = messages.iter().map(|m| m.id.to_string()).collect();
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let mut reads: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
    let sql = format!(
        "SELECT message_id, user_id, read_at FROM message_reads
          WHERE message_id IN ({}) ORDER BY read_at",
        placeholders(1, ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |row| {
        let user_id: String = row.get(1)?;
        let read_at: String = row.get(2)?;
        Ok((
            row.get::<_, String>(0)?,
            ReadReceipt { user_id: decode_uuid(&user_id)?, read_at: decode_ts(&read_at)? },
        ))
    })?;
    for row in rows {
        let (message_id, receipt) = row?;
        reads.entry(message_id).or_default().push(receipt);
    }

    let mut edits: HashMap<String, Vec<EditRecord>> = HashMap::new();
    let sql = format!(
        "SELECT message_id, content, edited_at FROM message_edits
          WHERE message_id IN ({}) ORDER BY rowid",
        placeholders(1, ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |row| {
        let content: String = row.get(1)?;
        let edited_at: String = row.get(2)?;
        Ok((
            row.get::<_, String>(0)?,
            EditRecord {
                content: serde_json::from_str(&content).map_err(|e| conversion_error(&content, e))?,
                edited_at: decode_ts(&edited_at)?,
            },
        ))
    })?;
    for row in rows {
        let (message_id, record) = row?;
        edits.entry(message_id).or_default().push(record);
    }

    for message in &mut messages {
        let key = message.id.to_string();
        message.read_by = reads.remove(&key).unwrap_or_default();
        message.edit_history = edits.remove(&key).unwrap_or_default();
    }
    Ok(messages)
}
