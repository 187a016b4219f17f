use chrono::Utc;
use uuid::Uuid;

use courier_db::Database;
use courier_db::models::{NewConversation, NewMessage};
use courier_reconcile::run;
use courier_types::models::{ConversationMetadata, ConversationType, MessageContent, ParticipantRole};

/// A database from before the pair index existed, with room for duplicates.
fn legacy_db(dir: &tempfile::TempDir) -> Database {
    let db = Database::open(&dir.path().join("courier.db")).unwrap();
    db.with_conn_mut(|c| Ok(c.execute_batch("DROP INDEX idx_conversations_pair;")?))
        .unwrap();
    db
}

fn conversation(db: &Database, a: Uuid, b: Uuid, kind: ConversationType, metadata: ConversationMetadata) -> Uuid {
    let id = Uuid::new_v4();
    db.insert_conversation(&NewConversation {
        id,
        conversation_type: kind,
        participants: vec![(a, ParticipantRole::Member), (b, ParticipantRole::Member)],
        metadata,
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
            content: MessageContent::Text { text: format!("legacy {i}") },
            created_at: Utc::now(),
        })
        .unwrap();
    }
}

#[test]
fn three_duplicates_collapse_into_the_richest() {
    let dir = tempfile::tempdir().unwrap();
    let db = legacy_db(&dir);
    let (client, pro) = (Uuid::new_v4(), Uuid::new_v4());

    let first = conversation(
        &db,
        client,
        pro,
        ConversationType::Direct,
        ConversationMetadata { job_id: None, application_id: Some("app-3".into()) },
    );
    let project = conversation(
        &db,
        pro,
        client,
        ConversationType::Project,
        ConversationMetadata { job_id: Some("job-7".into()), application_id: None },
    );
    let third = conversation(&db, client, pro, ConversationType::Direct, ConversationMetadata::default());
    fill(&db, first, client, 5);
    fill(&db, project, pro, 2);
    fill(&db, third, client, 9);

    let report = run(&db, false).unwrap();
    assert_eq!(report.duplicate_sets, 1);
    assert_eq!(report.conversations_merged, 2);
    assert_eq!(report.messages_moved, 14);
    assert!(report.pair_index_enforced);

    let remaining = db.list_conversations_for_user(client, 10, 0).unwrap();
    assert_eq!(remaining.len(), 1);
    let (survivor, _) = &remaining[0];
    assert_eq!(survivor.id, project);
    assert_eq!(survivor.conversation_type, ConversationType::Project);
    assert_eq!(survivor.stats.total_messages, 16);
    assert_eq!(survivor.metadata.job_id.as_deref(), Some("job-7"));
    assert_eq!(survivor.metadata.application_id.as_deref(), Some("app-3"));
    assert_eq!(db.count_messages(project).unwrap(), 16);

    assert!(db.get_conversation(first).unwrap().is_none());
    assert!(db.get_conversation(third).unwrap().is_none());
    assert_eq!(db.merge_history().unwrap().len(), 2);
    assert_eq!(db.find_pair_conversation(client, pro).unwrap().unwrap().id, project);
}

#[test]
fn second_run_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = legacy_db(&dir);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let one = conversation(&db, a, b, ConversationType::Direct, ConversationMetadata::default());
    let two = conversation(&db, b, a, ConversationType::Direct, ConversationMetadata::default());
    fill(&db, one, a, 3);
    fill(&db, two, b, 4);

    let first = run(&db, false).unwrap();
    assert!(!first.is_noop());

    let second = run(&db, false).unwrap();
    assert!(second.is_noop());
    assert_eq!(second.duplicate_sets, 0);

    let remaining = db.list_conversations_for_user(a, 10, 0).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].0.stats.total_messages, 7);
}

#[test]
fn dry_run_leaves_duplicates_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let db = legacy_db(&dir);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    conversation(&db, a, b, ConversationType::Direct, ConversationMetadata::default());
    conversation(&db, a, b, ConversationType::Direct, ConversationMetadata::default());

    let report = run(&db, true).unwrap();
    assert_eq!(report.conversations_merged, 1);
    assert_eq!(db.list_conversations_for_user(a, 10, 0).unwrap().len(), 2);

    let applied = run(&db, false).unwrap();
    assert_eq!(applied.conversations_merged, 1);
    assert_eq!(db.list_conversations_for_user(a, 10, 0).unwrap().len(), 1);
}
