use anyhow::Result;
use rusqlite::{Connection, ErrorCode};
use tracing::{info, warn};

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (conversations, messages, notifications)");
        conn.execute_batch(
            "
            CREATE TABLE conversations (
                id                      TEXT PRIMARY KEY,
                conversation_type       TEXT NOT NULL,
                -- sorted 'a:b' of the two active participants; NULL for groups
                pair_key                TEXT,
                job_id                  TEXT,
                application_id          TEXT,
                last_message_id         TEXT,
                last_message_preview    TEXT,
                last_message_sender_id  TEXT,
                last_message_at         TEXT,
                last_message_type       TEXT,
                total_messages          INTEGER NOT NULL DEFAULT 0,
                last_activity           TEXT NOT NULL,
                created_at              TEXT NOT NULL,
                updated_at              TEXT NOT NULL
            );

            CREATE INDEX idx_conversations_activity
                ON conversations(last_activity);

            CREATE TABLE conversation_participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL,
                role            TEXT NOT NULL,
                is_active       INTEGER NOT NULL DEFAULT 1,
                joined_at       TEXT NOT NULL,
                left_at         TEXT,
                position        INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user
                ON conversation_participants(user_id, is_active);

            CREATE TABLE messages (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                id              TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id       TEXT NOT NULL,
                receiver_id     TEXT,
                message_type    TEXT NOT NULL,
                content         TEXT NOT NULL,
                delivery_status TEXT NOT NULL,
                is_edited       INTEGER NOT NULL DEFAULT 0,
                is_deleted      INTEGER NOT NULL DEFAULT 0,
                deleted_by      TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, seq);

            CREATE TABLE message_reads (
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL,
                read_at     TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE TABLE message_edits (
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                content     TEXT NOT NULL,
                edited_at   TEXT NOT NULL
            );

            CREATE INDEX idx_message_edits_message
                ON message_edits(message_id);

            CREATE TABLE notifications (
                id                  TEXT PRIMARY KEY,
                recipient_id        TEXT NOT NULL,
                sender_id           TEXT,
                notification_type   TEXT NOT NULL,
                title               TEXT NOT NULL,
                message             TEXT NOT NULL,
                related_data        TEXT NOT NULL DEFAULT '{}',
                is_read             INTEGER NOT NULL DEFAULT 0,
                read_at             TEXT,
                email_sent          INTEGER NOT NULL DEFAULT 0,
                email_sent_at       TEXT,
                expires_at          TEXT,
                created_at          TEXT NOT NULL
            );

            CREATE INDEX idx_notifications_recipient
                ON notifications(recipient_id, is_read, created_at);

            CREATE TABLE notification_preferences (
                user_id     TEXT PRIMARY KEY,
                email       INTEGER NOT NULL,
                push        INTEGER NOT NULL,
                messages    INTEGER NOT NULL,
                jobs        INTEGER NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (conversation merge audit)");
        conn.execute_batch(
            "
            CREATE TABLE conversation_merges (
                survivor_id     TEXT NOT NULL,
                merged_id       TEXT NOT NULL,
                messages_moved  INTEGER NOT NULL,
                merged_at       TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    ensure_pair_index(conn)?;

    info!("Database migrations complete");
    Ok(())
}

/// Enforce one conversation per participant pair at the storage layer.
///
/// Returns false when existing duplicates prevent the index from being
/// built; the reconciliation job merges them and calls this again.
pub fn ensure_pair_index(conn: &Connection) -> Result<bool> {
    let result = conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
            ON conversations(pair_key) WHERE pair_key IS NOT NULL;",
    );

    match result {
        Ok(()) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            warn!("Duplicate pair conversations present; run courier-reconcile to enforce uniqueness");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
