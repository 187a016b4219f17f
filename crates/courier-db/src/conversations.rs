use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use courier_types::models::{
    Conversation, ConversationMetadata, ConversationStats, ConversationType, LastMessage,
    MessageType, Participant, ParticipantRole,
};

use crate::models::{InsertOutcome, NewConversation};
use crate::{
    Database, OptionalExt, decode_enum, decode_ts, decode_uuid, encode_ts, is_unique_violation,
    placeholders,
};

pub(crate) const CONVERSATION_COLUMNS: &str = "c.id, c.conversation_type, c.job_id, c.application_id, \
     c.last_message_id, c.last_message_preview, c.last_message_sender_id, c.last_message_at, \
     c.last_message_type, c.total_messages, c.last_activity, c.created_at, c.updated_at";

/// Canonical, order-independent key for a participant pair.
pub fn pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

/// Conversation row without its participants.
pub(crate) struct ConversationBase {
    id: Uuid,
    conversation_type: ConversationType,
    metadata: ConversationMetadata,
    last_message: Option<LastMessage>,
    total_messages: u64,
    last_activity: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Database {
    /// The conversation whose two active participants are exactly `{a, b}`.
    pub fn find_pair_conversation(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        let key = pair_key(a, b);
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.pair_key = ?1 \
                 ORDER BY c.created_at LIMIT 1"
            );
            let base = conn.query_row(&sql, [&key], conversation_base).optional()?;
            match base {
                Some(base) => Ok(Some(attach_participants(conn, vec![base])?.remove(0))),
                None => Ok(None),
            }
        })
    }

    /// Insert a conversation and its participants in one transaction.
    ///
    /// Pair conversations carry a `pair_key`; a UNIQUE violation on it means
    /// another writer created the pair first and is reported as `Duplicate`.
    pub fn insert_conversation(&self, new: &NewConversation) -> Result<InsertOutcome> {
        let key = match (new.conversation_type.is_pair(), new.participants.as_slice()) {
            (true, [(a, _), (b, _)]) => Some(pair_key(*a, *b)),
            _ => None,
        };
        let created = encode_ts(&new.created_at);

        let result = self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO conversations
                    (id, conversation_type, pair_key, job_id, application_id, total_messages,
                     last_activity, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, ?6)",
                params![
                    new.id.to_string(),
                    new.conversation_type.as_str(),
                    key,
                    new.metadata.job_id,
                    new.metadata.application_id,
                    created,
                ],
            )?;

            for (position, (user_id, role)) in new.participants.iter().enumerate() {
                tx.execute(
                    "INSERT INTO conversation_participants
                        (conversation_id, user_id, role, is_active, joined_at, position)
                     VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                    params![
                        new.id.to_string(),
                        user_id.to_string(),
                        role.as_str(),
                        created,
                        position as i64,
                    ],
                )?;
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(InsertOutcome::Inserted(Conversation {
                id: new.id,
                conversation_type: new.conversation_type,
                participants: new
                    .participants
                    .iter()
                    .map(|(user_id, role)| Participant {
                        user_id: *user_id,
                        role: *role,
                        is_active: true,
                        joined_at: new.created_at,
                        left_at: None,
                    })
                    .collect(),
                last_message: None,
                metadata: new.metadata.clone(),
                stats: ConversationStats {
                    total_messages: 0,
                    last_activity: new.created_at,
                    participant_count: new.participants.len() as u32,
                },
                created_at: new.created_at,
                updated_at: new.created_at,
            })),
            Err(e) if key.is_some() && is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| load_conversation(conn, id))
    }

    /// Conversations the user actively participates in, most recent activity
    /// first, each with the user's unread message count.
    pub fn list_conversations_for_user(
        &self,
        user_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<(Conversation, u64)>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS},
                    (SELECT COUNT(*) FROM messages m
                      WHERE m.conversation_id = c.id
                        AND m.sender_id != ?1
                        AND m.is_deleted = 0
                        AND m.delivery_status != 'failed'
                        AND NOT EXISTS (SELECT 1 FROM message_reads r
                                         WHERE r.message_id = m.id AND r.user_id = ?1)) AS unread
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1 AND p.is_active = 1
                 ORDER BY c.last_activity DESC, c.id DESC
                 LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id.to_string(), limit, offset], |row| {
                    Ok((conversation_base(row)?, row.get::<_, i64>(13)? as u64))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let (bases, unread): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
            let conversations = attach_participants(conn, bases)?;
            Ok(conversations.into_iter().zip(unread).collect())
        })
    }

    /// Merge richer context into a conversation in one statement: metadata
    /// fields are only filled where empty and `direct` only moves to
    /// `project`. Concurrent callers cannot undo each other. Returns whether
    /// anything changed.
    pub fn enrich_conversation(
        &self,
        id: Uuid,
        conversation_type: ConversationType,
        metadata: &ConversationMetadata,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let upgrade = conversation_type == ConversationType::Project;
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE conversations
                    SET job_id = COALESCE(job_id, ?2),
                        application_id = COALESCE(application_id, ?3),
                        conversation_type = CASE
                            WHEN ?1 AND conversation_type = 'direct' THEN 'project'
                            ELSE conversation_type
                        END,
                        updated_at = ?4
                  WHERE id = ?5
                    AND ((job_id IS NULL AND ?2 IS NOT NULL)
                      OR (application_id IS NULL AND ?3 IS NOT NULL)
                      OR (?1 AND conversation_type = 'direct'))",
                params![
                    upgrade,
                    metadata.job_id,
                    metadata.application_id,
                    encode_ts(&now),
                    id.to_string(),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Add a participant, or reactivate one who left earlier.
    pub fn add_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = encode_ts(&now);
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO conversation_participants
                    (conversation_id, user_id, role, is_active, joined_at, position)
                 VALUES (?1, ?2, ?3, 1, ?4,
                    (SELECT COALESCE(MAX(position), -1) + 1
                       FROM conversation_participants WHERE conversation_id = ?1))
                 ON CONFLICT(conversation_id, user_id)
                 DO UPDATE SET is_active = 1, left_at = NULL, joined_at = excluded.joined_at",
                params![conversation_id.to_string(), user_id.to_string(), role.as_str(), now],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![now, conversation_id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Mark a participant as having left. Returns false if they were not active.
    pub fn deactivate_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = encode_ts(&now);
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE conversation_participants SET is_active = 0, left_at = ?1
                  WHERE conversation_id = ?2 AND user_id = ?3 AND is_active = 1",
                params![now, conversation_id.to_string(), user_id.to_string()],
            )?;
            if changed > 0 {
                tx.execute(
                    "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                    params![now, conversation_id.to_string()],
                )?;
            }
            Ok(changed > 0)
        })
    }
}

pub(crate) fn load_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1");
    let base = conn.query_row(&sql, [id.to_string()], conversation_base).optional()?;
    match base {
        Some(base) => Ok(Some(attach_participants(conn, vec![base])?.remove(0))),
        None => Ok(None),
    }
}

pub(crate) fn conversation_base(row: &Row<'_>) -> rusqlite::Result<ConversationBase> {
    let id: String = row.get(0)?;
    let conversation_type: String = row.get(1)?;
    let last_message_id: Option<String> = row.get(4)?;

    let last_message = match last_message_id {
        Some(message_id) => {
            let sender: String = row.get(6)?;
            let at: String = row.get(7)?;
            let message_type: String = row.get(8)?;
            Some(LastMessage {
                message_id: decode_uuid(&message_id)?,
                preview: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                sender_id: decode_uuid(&sender)?,
                timestamp: decode_ts(&at)?,
                message_type: decode_enum(&message_type, MessageType::from_db)?,
            })
        }
        None => None,
    };

    Ok(ConversationBase {
        id: decode_uuid(&id)?,
        conversation_type: decode_enum(&conversation_type, ConversationType::from_db)?,
        metadata: ConversationMetadata {
            job_id: row.get(2)?,
            application_id: row.get(3)?,
        },
        last_message,
        total_messages: row.get::<_, i64>(9)?.max(0) as u64,
        last_activity: decode_ts(&row.get::<_, String>(10)?)?,
        created_at: decode_ts(&row.get::<_, String>(11)?)?,
        updated_at: decode_ts(&row.get::<_, String>(12)?)?,
    })
}

/// Batch-load participants for the given rows (single query) and assemble.
pub(crate) fn attach_participants(
    conn: &Connection,
    bases: Vec<ConversationBase>,
) -> Result<Vec<Conversation>> {
    if bases.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<String> = bases.iter().map(|b| b.id.to_string()).collect();
    let sql = format!(
        "SELECT conversation_id, user_id, role, is_active, joined_at, left_at
           FROM conversation_participants
          WHERE conversation_id IN ({})
          ORDER BY conversation_id, position",
        placeholders(1, ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let mut by_conversation: HashMap<String, Vec<Participant>> = HashMap::new();
    let rows = stmt.query_map(params.as_slice(), |row| {
        let user_id: String = row.get(1)?;
        let role: String = row.get(2)?;
        let joined_at: String = row.get(4)?;
        let left_at: Option<String> = row.get(5)?;
        Ok((
            row.get::<_, String>(0)?,
            Participant {
                user_id: decode_uuid(&user_id)?,
                role: ParticipantRole::from_db(&role),
                is_active: row.get::<_, i64>(3)? != 0,
                joined_at: decode_ts(&joined_at)?,
                left_at: left_at.as_deref().map(decode_ts).transpose()?,
            },
        ))
    })?;
    for row in rows {
        let (conversation_id, participant) = row?;
        by_conversation.entry(conversation_id).or_default().push(participant);
    }

    Ok(bases
        .into_iter()
        .map(|base| {
            let participants = by_conversation.remove(&base.id.to_string()).unwrap_or_default();
            let active = participants.iter().filter(|p| p.is_active).count() as u32;
            Conversation {
                id: base.id,
                conversation_type: base.conversation_type,
                participants,
                last_message: base.last_message,
                metadata: base.metadata,
                stats: ConversationStats {
                    total_messages: base.total_messages,
                    last_activity: base.last_activity,
                    participant_count: active,
                },
                created_at: base.created_at,
                updated_at: base.updated_at,
            }
        })
        .collect())
}
