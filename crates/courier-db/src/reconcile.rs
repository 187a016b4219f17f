//! Offline consolidation of duplicate pair conversations.
//!
//! Each duplicate set is merged in its own transaction against a fresh read
//! of the rows involved, so the job can run while the server is live.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info};
use uuid::Uuid;

use courier_types::models::{
    ConversationMetadata, ConversationType, DELETED_PREVIEW, MessageContent, PREVIEW_CHARS,
};

use crate::conversations::pair_key;
use crate::migrations::ensure_pair_index;
use crate::{Database, OptionalExt, decode_enum, decode_ts, decode_uuid, encode_ts};

/// One duplicate set: the conversation that stays and the ones folded into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub pair: (Uuid, Uuid),
    pub survivor: Uuid,
    pub merged: Vec<Uuid>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub duplicate_sets: usize,
    pub conversations_merged: usize,
    pub messages_moved: usize,
    pub stats_corrected: usize,
    pub pair_keys_backfilled: usize,
    /// The unique pair index exists after the run.
    pub pair_index_enforced: bool,
}

impl ReconcileReport {
    /// Whether the run changed (or, dry, would change) anything.
    pub fn is_noop(&self) -> bool {
        self.conversations_merged == 0
            && self.messages_moved == 0
            && self.stats_corrected == 0
            && self.pair_keys_backfilled == 0
    }
}

struct Candidate {
    conversation_type: ConversationType,
    total_messages: i64,
    updated_at: DateTime<Utc>,
    members: Vec<Uuid>,
}

struct Profile {
    conversation_type: ConversationType,
    metadata: ConversationMetadata,
}

impl Database {
    /// Find every pair with more than one conversation and pick its survivor:
    /// richest type first, then most messages, then most recently updated.
    pub fn plan_reconciliation(&self) -> Result<Vec<MergePlan>> {
        let candidates = self.with_conn(load_candidates)?;

        let mut sets: HashMap<(Uuid, Uuid), Vec<(Uuid, Candidate)>> = HashMap::new();
        for (id, candidate) in candidates {
            if let [a, b] = candidate.members[..] {
                let pair = if a <= b { (a, b) } else { (b, a) };
                sets.entry(pair).or_default().push((id, candidate));
            }
        }

        let mut plans: Vec<MergePlan> = sets
            .into_iter()
            .filter(|(_, set)| set.len() > 1)
            .map(|(pair, mut set)| {
                set.sort_by(|(id_a, a), (id_b, b)| {
                    b.conversation_type
                        .richness()
                        .cmp(&a.conversation_type.richness())
                        .then(b.total_messages.cmp(&a.total_messages))
                        .then(b.updated_at.cmp(&a.updated_at))
                        .then(id_a.cmp(id_b))
                });
                let mut ids = set.into_iter().map(|(id, _)| id);
                let survivor = ids.next().unwrap_or_default();
                MergePlan { pair, survivor, merged: ids.collect() }
            })
            .collect();
        plans.sort_by_key(|p| p.pair);
        Ok(plans)
    }

    /// Merge duplicate sets, correct summary stats, backfill pair keys and
    /// (re)create the uniqueness index. With `dry_run` nothing is written and
    /// the report describes what a real run would do.
    pub fn reconcile(&self, dry_run: bool, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let plans = self.plan_reconciliation()?;
        let mut report = ReconcileReport { duplicate_sets: plans.len(), ..Default::default() };

        for plan in &plans {
            let moved = if dry_run {
                self.with_conn(|conn| {
                    let mut moved = 0;
                    for id in &plan.merged {
                        moved += message_count(conn, *id)?;
                    }
                    Ok(moved)
                })?
            } else {
                self.with_tx(|tx| merge_set(tx, plan, now))?
            };
            info!(
                "{} {} conversation(s) into {} ({} messages)",
                if dry_run { "Would merge" } else { "Merged" },
                plan.merged.len(),
                plan.survivor,
                moved
            );
            report.conversations_merged += plan.merged.len();
            report.messages_moved += moved;
        }

        if dry_run {
            // Nothing moved, so survivors are judged as if their duplicates
            // were already folded in.
            let folded: HashMap<Uuid, Vec<Uuid>> =
                plans.iter().map(|p| (p.survivor, p.merged.clone())).collect();
            self.with_conn(|conn| {
                report.stats_corrected = correct_stats(conn, &folded, true, now)?;
                report.pair_keys_backfilled = backfill_pair_keys(conn, true)?;
                report.pair_index_enforced = pair_index_exists(conn)?;
                Ok(())
            })?;
        } else {
            report.stats_corrected =
                self.with_tx(|tx| correct_stats(tx, &HashMap::new(), false, now))?;
            report.pair_keys_backfilled = self.with_tx(|tx| backfill_pair_keys(tx, false))?;
            report.pair_index_enforced = self.with_conn_mut(ensure_pair_index)?;
        }

        Ok(report)
    }

    /// Audit rows written by previous merges, oldest first.
    pub fn merge_history(&self) -> Result<Vec<(Uuid, Uuid, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT survivor_id, merged_id, messages_moved FROM conversation_merges
                  ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let survivor: String = row.get(0)?;
                    let merged: String = row.get(1)?;
                    Ok((decode_uuid(&survivor)?, decode_uuid(&merged)?, row.get::<_, i64>(2)? as u64))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn load_candidates(conn: &Connection) -> Result<Vec<(Uuid, Candidate)>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.conversation_type, c.total_messages, c.updated_at, p.user_id
           FROM conversations c
           JOIN conversation_participants p ON p.conversation_id = c.id AND p.is_active = 1
          WHERE c.conversation_type != 'group'
          ORDER BY c.id, p.user_id",
    )?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let conversation_type: String = row.get(1)?;
        let updated_at: String = row.get(3)?;
        let user_id: String = row.get(4)?;
        Ok((
            decode_uuid(&id)?,
            decode_enum(&conversation_type, ConversationType::from_db)?,
            row.get::<_, i64>(2)?,
            decode_ts(&updated_at)?,
            decode_uuid(&user_id)?,
        ))
    })?;

    let mut out: Vec<(Uuid, Candidate)> = Vec::new();
    for row in rows {
        let (id, conversation_type, total_messages, updated_at, user_id) = row?;
        match out.last_mut() {
            Some((last, candidate)) if *last == id => candidate.members.push(user_id),
            _ => out.push((
                id,
                Candidate { conversation_type, total_messages, updated_at, members: vec![user_id] },
            )),
        }
    }
    Ok(out)
}

/// Fold `plan.merged` into `plan.survivor`. Rows that disappeared since the
/// plan was made are skipped.
fn merge_set(conn: &Connection, plan: &MergePlan, now: DateTime<Utc>) -> Result<usize> {
    let Some(mut survivor) = load_profile(conn, plan.survivor)? else {
        debug!("Survivor {} vanished before merge, skipping set", plan.survivor);
        return Ok(0);
    };
    let survivor_id = plan.survivor.to_string();
    let now = encode_ts(&now);
    let mut total_moved = 0;

    for merged in &plan.merged {
        let Some(profile) = load_profile(conn, *merged)? else {
            continue;
        };
        let merged_id = merged.to_string();

        // Explicit re-parenting; seq is kept so order survives the move.
        let moved = conn.execute(
            "UPDATE messages SET conversation_id = ?1 WHERE conversation_id = ?2",
            params![survivor_id, merged_id],
        )?;
        conn.execute(
            "UPDATE notifications
                SET related_data = json_set(related_data, '$.conversation_id', ?1)
              WHERE json_extract(related_data, '$.conversation_id') = ?2",
            params![survivor_id, merged_id],
        )?;

        survivor.metadata = survivor.metadata.merged_with(&profile.metadata);
        if profile.conversation_type.richness() > survivor.conversation_type.richness() {
            survivor.conversation_type = profile.conversation_type;
        }

        conn.execute("DELETE FROM conversations WHERE id = ?1", [&merged_id])?;
        conn.execute(
            "INSERT INTO conversation_merges (survivor_id, merged_id, messages_moved, merged_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![survivor_id, merged_id, moved as i64, now],
        )?;
        total_moved += moved;
    }

    conn.execute(
        "UPDATE conversations
            SET conversation_type = ?1, job_id = ?2, application_id = ?3, updated_at = ?4
          WHERE id = ?5",
        params![
            survivor.conversation_type.as_str(),
            survivor.metadata.job_id,
            survivor.metadata.application_id,
            now,
            survivor_id,
        ],
    )?;
    Ok(total_moved)
}

fn load_profile(conn: &Connection, id: Uuid) -> Result<Option<Profile>> {
    conn.query_row(
        "SELECT conversation_type, job_id, application_id FROM conversations WHERE id = ?1",
        [id.to_string()],
        |row| {
            let conversation_type: String = row.get(0)?;
            Ok(Profile {
                conversation_type: decode_enum(&conversation_type, ConversationType::from_db)?,
                metadata: ConversationMetadata {
                    job_id: row.get(1)?,
                    application_id: row.get(2)?,
                },
            })
        },
    )
    .optional()
}

fn message_count(conn: &Connection, conversation_id: Uuid) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
        [conversation_id.to_string()],
        |r| r.get(0),
    )?;
    Ok(count as usize)
}

/// Recompute `total_messages` and the last-message cache from the messages
/// table. Only rows that disagree are written. Returns how many disagreed.
///
/// `folded` maps a survivor to duplicates whose messages count as its own;
/// the duplicates themselves are not checked.
fn correct_stats(
    conn: &Connection,
    folded: &HashMap<Uuid, Vec<Uuid>>,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.total_messages, c.last_message_id, c.last_activity,
                (SELECT COUNT(*) FROM messages m
                  WHERE m.conversation_id = c.id AND m.delivery_status != 'failed'),
                (SELECT m.seq FROM messages m
                  WHERE m.conversation_id = c.id AND m.delivery_status != 'failed'
                  ORDER BY m.seq DESC LIMIT 1)
           FROM conversations c",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let last_activity: String = row.get(3)?;
            Ok((
                decode_uuid(&id)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                decode_ts(&last_activity)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let actual: HashMap<Uuid, (i64, Option<i64>)> = rows
        .iter()
        .map(|(id, _, _, _, total, last_seq)| (*id, (*total, *last_seq)))
        .collect();
    let absorbed: Vec<Uuid> = folded.values().flatten().copied().collect();

    let mut corrected = 0;
    for (id, stored_total, stored_last, last_activity, mut actual_total, mut last_seq) in rows {
        if absorbed.contains(&id) {
            continue;
        }
        for merged in folded.get(&id).into_iter().flatten() {
            if let Some((total, seq)) = actual.get(merged) {
                actual_total += total;
                last_seq = last_seq.max(*seq);
            }
        }
        let last = match last_seq {
            Some(seq) => Some(last_message_summary(conn, seq)?),
            None => None,
        };
        let actual_last = last.as_ref().map(|l| l.id.to_string());
        if stored_total == actual_total && stored_last == actual_last {
            continue;
        }

        corrected += 1;
        debug!(
            "Conversation {} stats {} -> {} messages",
            id, stored_total, actual_total
        );
        if dry_run {
            continue;
        }

        match last {
            Some(last) => {
                let activity = last_activity.max(last.created_at);
                conn.execute(
                    "UPDATE conversations
                        SET total_messages = ?1, last_message_id = ?2, last_message_preview = ?3,
                            last_message_sender_id = ?4, last_message_at = ?5,
                            last_message_type = ?6, last_activity = ?7, updated_at = ?8
                      WHERE id = ?9",
                    params![
                        actual_total,
                        last.id.to_string(),
                        last.preview,
                        last.sender_id,
                        encode_ts(&last.created_at),
                        last.message_type,
                        encode_ts(&activity),
                        encode_ts(&now),
                        id.to_string(),
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE conversations
                        SET total_messages = ?1, last_message_id = NULL,
                            last_message_preview = NULL, last_message_sender_id = NULL,
                            last_message_at = NULL, last_message_type = NULL, updated_at = ?2
                      WHERE id = ?3",
                    params![actual_total, encode_ts(&now), id.to_string()],
                )?;
            }
        }
    }
    Ok(corrected)
}

struct LastSummary {
    id: Uuid,
    preview: String,
    sender_id: String,
    message_type: String,
    created_at: DateTime<Utc>,
}

fn last_message_summary(conn: &Connection, seq: i64) -> Result<LastSummary> {
    let (id, sender_id, message_type, content, is_deleted, created_at) = conn.query_row(
        "SELECT id, sender_id, message_type, content, is_deleted, created_at
           FROM messages WHERE seq = ?1",
        [seq],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)? != 0,
                row.get::<_, String>(5)?,
            ))
        },
    )?;

    let preview = if is_deleted {
        DELETED_PREVIEW.to_string()
    } else {
        serde_json::from_str::<MessageContent>(&content)?.preview(PREVIEW_CHARS)
    };
    Ok(LastSummary {
        id: decode_uuid(&id)?,
        preview,
        sender_id,
        message_type,
        created_at: decode_ts(&created_at)?,
    })
}

/// Give legacy pair conversations their `pair_key`. Skips keys already taken.
fn backfill_pair_keys(conn: &Connection, dry_run: bool) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT c.id, GROUP_CONCAT(p.user_id)
           FROM conversations c
           JOIN conversation_participants p ON p.conversation_id = c.id AND p.is_active = 1
          WHERE c.conversation_type != 'group' AND c.pair_key IS NULL
          GROUP BY c.id
         HAVING COUNT(*) = 2",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut filled = 0;
    for (id, members) in rows {
        let ids: Vec<Uuid> = members
            .split(',')
            .map(decode_uuid)
            .collect::<std::result::Result<_, _>>()?;
        let [a, b] = ids[..] else { continue };
        let key = pair_key(a, b);

        let taken: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM conversations WHERE pair_key = ?1)",
            [&key],
            |r| r.get(0),
        )?;
        if taken {
            continue;
        }
        if !dry_run {
            conn.execute("UPDATE conversations SET pair_key = ?1 WHERE id = ?2", params![key, id])?;
        }
        filled += 1;
    }
    Ok(filled)
}

fn pair_index_exists(conn: &Connection) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master
                         WHERE type = 'index' AND name = 'idx_conversations_pair')",
        [],
        |r| r.get(0),
    )?;
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewConversation, NewMessage};
    use courier_types::models::ParticipantRole;

    fn legacy_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn_mut(|c| Ok(c.execute_batch("DROP INDEX idx_conversations_pair;")?))
            .unwrap();
        db
    }

    fn conversation(db: &Database, a: Uuid, b: Uuid, kind: ConversationType) -> Uuid {
        let id = Uuid::new_v4();
        db.insert_conversation(&NewConversation {
            id,
            conversation_type: kind,
            participants: vec![(a, ParticipantRole::Member), (b, ParticipantRole::Member)],
            metadata: ConversationMetadata::default(),
            created_at: Utc::now(),
        })
        .unwrap();
        id
    }

    fn fill(db: &Database, conversation_id: Uuid, sender: Uuid, count: usize) {
        for i in 0..count {
            db.append_message(&NewMessage {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: sender,
                receiver_id: None,
                content: MessageContent::Text { text: format!("message {i}") },
                created_at: Utc::now(),
            })
            .unwrap();
        }
    }

    #[test]
    fn survivor_prefers_richer_type_then_volume() {
        let db = legacy_db();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let busy_direct = conversation(&db, a, b, ConversationType::Direct);
        let quiet_project = conversation(&db, b, a, ConversationType::Project);
        fill(&db, busy_direct, a, 3);

        let plans = db.plan_reconciliation().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].survivor, quiet_project);
        assert_eq!(plans[0].merged, vec![busy_direct]);
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let db = legacy_db();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let first = conversation(&db, a, b, ConversationType::Direct);
        let second = conversation(&db, a, b, ConversationType::Direct);
        fill(&db, first, a, 2);
        fill(&db, second, b, 1);

        let report = db.reconcile(true, Utc::now()).unwrap();
        assert_eq!(report.duplicate_sets, 1);
        assert_eq!(report.conversations_merged, 1);
        assert_eq!(report.messages_moved, 1);
        assert!(!report.pair_index_enforced);

        assert!(db.get_conversation(first).unwrap().is_some());
        assert!(db.get_conversation(second).unwrap().is_some());
        assert!(db.merge_history().unwrap().is_empty());
    }

    #[test]
    fn dry_run_counts_the_same_corrections_as_a_real_run() {
        let db = legacy_db();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let survivor = conversation(&db, a, b, ConversationType::Direct);
        let duplicate = conversation(&db, b, a, ConversationType::Direct);
        let lonely = conversation(&db, a, c, ConversationType::Direct);
        fill(&db, survivor, a, 3);
        fill(&db, duplicate, b, 1);
        fill(&db, lonely, c, 2);
        db.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE conversations SET total_messages = 0 WHERE id = ?1",
                [lonely.to_string()],
            )?;
            Ok(())
        })
        .unwrap();

        let dry = db.reconcile(true, Utc::now()).unwrap();
        let applied = db.reconcile(false, Utc::now()).unwrap();
        assert_eq!(dry.stats_corrected, 2);
        assert_eq!(dry.stats_corrected, applied.stats_corrected);
        assert_eq!(dry.messages_moved, applied.messages_moved);
        assert_eq!(db.get_conversation(survivor).unwrap().unwrap().stats.total_messages, 4);
    }

    #[test]
    fn stale_stats_and_missing_keys_are_repaired() {
        let db = legacy_db();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let id = conversation(&db, a, b, ConversationType::Direct);
        fill(&db, id, a, 4);
        db.with_conn_mut(|c| {
            c.execute(
                "UPDATE conversations SET total_messages = 1, pair_key = NULL WHERE id = ?1",
                [id.to_string()],
            )?;
            Ok(())
        })
        .unwrap();

        let report = db.reconcile(false, Utc::now()).unwrap();
        assert_eq!(report.stats_corrected, 1);
        assert_eq!(report.pair_keys_backfilled, 1);
        assert!(report.pair_index_enforced);
        assert_eq!(db.get_conversation(id).unwrap().unwrap().stats.total_messages, 4);
        assert_eq!(db.find_pair_conversation(b, a).unwrap().unwrap().id, id);
    }

    #[test]
    fn notification_links_follow_the_survivor() {
        let db = legacy_db();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let keep = conversation(&db, a, b, ConversationType::Project);
        let gone = conversation(&db, a, b, ConversationType::Direct);
        fill(&db, gone, a, 1);

        let notification = db
            .insert_notification(&crate::models::NewNotification {
                id: Uuid::new_v4(),
                recipient_id: b,
                sender_id: Some(a),
                notification_type: courier_types::models::NotificationType::NewMessage,
                title: "New message".into(),
                message: "message 0".into(),
                related_data: courier_types::models::RelatedData {
                    conversation_id: Some(gone),
                    ..Default::default()
                },
                expires_at: None,
                created_at: Utc::now(),
            })
            .unwrap();

        db.reconcile(false, Utc::now()).unwrap();
        let stored = db.get_notification(notification.id).unwrap().unwrap();
        assert_eq!(stored.related_data.conversation_id, Some(keep));
        assert_eq!(db.merge_history().unwrap(), vec![(keep, gone, 1)]);
    }
}
