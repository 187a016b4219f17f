use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use courier_core::{
    Courier, CourierConfig, Dispatcher, EmailRequest, Mailer, NotificationRequest, OutgoingMessage,
    PairOptions, StaticDirectory,
};
use courier_db::Database;
use courier_types::events::GatewayEvent;
use courier_types::models::{
    ConversationMetadata, ConversationType, DeliveryStatus, MessageContent, NotificationType, RelatedData,
};

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<EmailRequest>>,
}

#[async_trait]
impl Mailer for Outbox {
    async fn send(&self, email: &EmailRequest) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

struct Harness {
    courier: Courier,
    db: Arc<Database>,
    outbox: Arc<Outbox>,
    _dir: tempfile::TempDir,
}

fn harness(directory: StaticDirectory) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("courier.db")).unwrap());
    let outbox = Arc::new(Outbox::default());
    let courier = Courier::new(
        db.clone(),
        Dispatcher::new(),
        outbox.clone(),
        Arc::new(directory),
        CourierConfig::default(),
    );
    Harness { courier, db, outbox, _dir: dir }
}

fn text(body: &str) -> MessageContent {
    MessageContent::Text { text: body.into() }
}

fn to(receiver: Uuid, body: &str) -> OutgoingMessage {
    OutgoingMessage {
        conversation_id: None,
        receiver_id: Some(receiver),
        content: text(body),
        client_ref: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_find_or_create_yields_one_conversation() {
    let h = harness(StaticDirectory::default());
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let courier = h.courier.clone();
        let (x, y) = if i % 2 == 0 { (a, b) } else { (b, a) };
        tasks.push(tokio::spawn(async move {
            courier.find_or_create(x, y, PairOptions::default()).await
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().unwrap().id);
    }
    assert_eq!(ids.len(), 1);

    let listed = h.courier.list_conversations(a, None, None).await.unwrap().0;
    assert_eq!(listed.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enrichment_never_loses_context() {
    let h = harness(StaticDirectory::default());
    let (client, pro) = (Uuid::new_v4(), Uuid::new_v4());
    let base = h.courier.find_or_create(client, pro, PairOptions::default()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let courier = h.courier.clone();
        let options = if i % 2 == 0 {
            PairOptions {
                conversation_type: Some(ConversationType::Project),
                metadata: ConversationMetadata { job_id: Some("job-42".into()), application_id: None },
            }
        } else {
            PairOptions {
                conversation_type: Some(ConversationType::Direct),
                metadata: ConversationMetadata { job_id: None, application_id: Some("app-9".into()) },
            }
        };
        tasks.push(tokio::spawn(async move { courier.find_or_create(pro, client, options).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().id, base.id);
    }

    let stored = h.db.get_conversation(base.id).unwrap().unwrap();
    assert_eq!(stored.conversation_type, ConversationType::Project);
    assert_eq!(stored.metadata.job_id.as_deref(), Some("job-42"));
    assert_eq!(stored.metadata.application_id.as_deref(), Some("app-9"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_professionals_messaging_one_client_make_two_conversations() {
    let h = harness(StaticDirectory::default());
    let client = Uuid::new_v4();
    let (pro_one, pro_two) = (Uuid::new_v4(), Uuid::new_v4());

    let mut tasks = Vec::new();
    for pro in [pro_one, pro_two, pro_one, pro_two] {
        let courier = h.courier.clone();
        tasks.push(tokio::spawn(async move {
            courier.send_message(pro, to(client, "Interested in your job")).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let (conversations, _) = h.courier.list_conversations(client, None, None).await.unwrap();
    assert_eq!(conversations.len(), 2);
    for (conversation, unread) in conversations {
        assert_eq!(conversation.stats.total_messages, 2);
        assert_eq!(unread, 2);
    }
}

#[tokio::test]
async fn offline_client_gets_notification_email_and_reads_later() {
    let client = Uuid::new_v4();
    let pro = Uuid::new_v4();
    let h = harness(StaticDirectory::default().with_email(client, "client@example.com"));

    let message = h.courier.send_message(pro, to(client, "Quote attached")).await.unwrap();
    assert_eq!(message.delivery_status, DeliveryStatus::Sent);

    let (notifications, unread) = h.courier.list_notifications(client, false, None, None).await.unwrap();
    assert_eq!(unread, 1);
    assert_eq!(notifications[0].notification_type, NotificationType::NewMessage);
    assert!(notifications[0].email_sent);
    assert_eq!(notifications[0].related_data.message_id, Some(message.id));
    assert_eq!(h.outbox.sent.lock().unwrap().len(), 1);

    // The client comes back and opens the conversation.
    let (_conn, mut client_rx) = h.courier.dispatcher().connect(client).await;
    let (_pro_conn, mut pro_rx) = h.courier.dispatcher().connect(pro).await;
    let (messages, _) = h
        .courier
        .get_messages(client, message.conversation_id, None, None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery_status, DeliveryStatus::Delivered);
    assert!(matches!(pro_rx.recv().await, Some(GatewayEvent::MessageDelivered { .. })));

    let read = h.courier.mark_read(client, message.id).await.unwrap();
    assert_eq!(read.delivery_status, DeliveryStatus::Read);
    assert!(matches!(pro_rx.recv().await, Some(GatewayEvent::MessageRead { .. })));
    assert!(client_rx.try_recv().is_err());
}

#[tokio::test]
async fn repeated_read_acknowledgment_keeps_one_receipt() {
    let h = harness(StaticDirectory::default());
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let message = h.courier.send_message(alice, to(bob, "ping")).await.unwrap();

    let first = h.courier.mark_read(bob, message.id).await.unwrap();
    let second = h.courier.mark_read(bob, message.id).await.unwrap();
    assert_eq!(first.read_by.len(), 1);
    assert_eq!(second.read_by.len(), 1);
    assert_eq!(second.read_by[0].user_id, bob);
    assert_eq!(second.delivery_status, DeliveryStatus::Read);

    let stored = h.db.get_message(message.id).unwrap().unwrap();
    assert_eq!(stored.read_by, first.read_by);
}

#[tokio::test]
async fn unread_count_is_created_minus_marked() {
    let h = harness(StaticDirectory::default());
    let user = Uuid::new_v4();
    let k = 7;
    let j = 3;

    let mut ids = Vec::new();
    for i in 0..k {
        let n = h
            .courier
            .create_notification(NotificationRequest {
                recipient_id: user,
                sender_id: None,
                notification_type: NotificationType::JobApplication,
                title: format!("Application {i}"),
                message: "A professional applied".into(),
                related_data: RelatedData::default(),
            })
            .await
            .unwrap();
        ids.push(n.id);
    }

    let remaining = h.courier.mark_notifications_read(user, ids[..j].to_vec()).await.unwrap();
    assert_eq!(remaining, (k - j) as u64);
    assert_eq!(h.courier.unread_count(user).await.unwrap(), (k - j) as u64);
}
