use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use ledgerdesk_api::{Messaging, MessagingError};
use ledgerdesk_db::Database;
use ledgerdesk_realtime::ChangeFeed;
use ledgerdesk_types::models::NewAttachment;

fn service() -> Messaging {
    let db = Database::open_in_memory().expect("in-memory db");
    Messaging::new(Arc::new(db), ChangeFeed::new())
}

fn add_user(messaging: &Messaging, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    messaging
        .db()
        .create_user(
            &id.to_string(),
            &format!("{}@lender.test", name.to_lowercase()),
            "not-a-real-hash",
            name,
        )
        .expect("create user");
    id
}

async fn direct(messaging: &Messaging, a: Uuid, b: Uuid) -> Uuid {
    messaging
        .create_conversation(a, &[b], false, None)
        .await
        .expect("create conversation")
        .id
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn page_is_bounded_and_strictly_descending() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let conv = direct(&messaging, u1, u2).await;

    for i in 0..60 {
        let sender = if i % 2 == 0 { u1 } else { u2 };
        messaging
            .send_message(conv, sender, &format!("message {}", i), vec![])
            .await
            .unwrap();
    }

    let page = messaging.fetch_messages(conv, Some(50), None).await.unwrap();
    assert_eq!(page.len(), 50);
    assert_eq!(page[0].content, "message 59");
    for pair in page.windows(2) {
        assert!(pair[0].created_at > pair[1].created_at);
    }

    let default_page = messaging.fetch_messages(conv, None, None).await.unwrap();
    assert_eq!(default_page.len(), 50);

    let older = messaging
        .fetch_messages(conv, Some(50), Some(page[49].created_at))
        .await
        .unwrap();
    assert_eq!(older.len(), 10);
    assert_eq!(older[0].content, "message 9");
}

#[tokio::test]
async fn sent_content_round_trips() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let conv = direct(&messaging, u1, u2).await;

    let content = "  Rate lock expires Friday, please sign by Thursday.\n";
    let sent = messaging.send_message(conv, u1, content, vec![]).await.unwrap();

    let latest = messaging.fetch_messages(conv, Some(1), None).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].id, sent.id);
    assert_eq!(latest[0].content, content);
    assert_eq!(latest[0].sender.as_ref().unwrap().full_name, "Avery");
}

#[tokio::test]
async fn mark_read_sets_exact_pointer_and_is_idempotent() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let conv = direct(&messaging, u1, u2).await;

    let first = messaging.send_message(conv, u1, "first", vec![]).await.unwrap();
    let second = messaging.send_message(conv, u1, "second", vec![]).await.unwrap();

    let pointer = || {
        messaging
            .db()
            .get_participant(&conv.to_string(), &u2.to_string())
            .unwrap()
            .unwrap()
            .last_read_message_id
    };

    messaging.mark_read(conv, u2, second.id).await.unwrap();
    assert_eq!(pointer(), Some(second.id.to_string()));
    messaging.mark_read(conv, u2, second.id).await.unwrap();
    assert_eq!(pointer(), Some(second.id.to_string()));

    // No forward-only rule: an older id is stored as given.
    messaging.mark_read(conv, u2, first.id).await.unwrap();
    assert_eq!(pointer(), Some(first.id.to_string()));
}

#[tokio::test]
async fn listing_is_stable_without_writes() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let u3 = add_user(&messaging, "Casey");
    let a = direct(&messaging, u1, u2).await;
    let b = direct(&messaging, u1, u3).await;
    messaging.send_message(a, u2, "ping", vec![]).await.unwrap();
    messaging.send_message(b, u3, "pong", vec![]).await.unwrap();

    let first = messaging.list_conversations(u1).await.unwrap();
    let second = messaging.list_conversations(u1).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);

    // Newest activity first, with participants and last message attached.
    assert_eq!(first[0].id, b);
    assert_eq!(first[0].participants.len(), 2);
    assert_eq!(first[0].last_message.as_ref().unwrap().content, "pong");
    assert_eq!(first[1].last_message.as_ref().unwrap().content, "ping");
}

#[tokio::test]
async fn hello_scenario() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let conv = direct(&messaging, u1, u2).await;

    messaging.send_message(conv, u1, "Hello", vec![]).await.unwrap();

    let page = messaging.fetch_messages(conv, Some(10), None).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].sender_id, u1);
    assert_eq!(page[0].content, "Hello");

    messaging.mark_read(conv, u2, page[0].id).await.unwrap();
    let listed = messaging.list_conversations(u2).await.unwrap();
    let me = listed[0].participant(u2).unwrap();
    assert_eq!(me.last_read_message_id, Some(page[0].id));
}

#[tokio::test]
async fn empty_conversation_returns_empty_page() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let conv = direct(&messaging, u1, u2).await;

    let page = messaging.fetch_messages(conv, Some(50), None).await.unwrap();
    assert!(page.is_empty());

    let listed = messaging.list_conversations(u1).await.unwrap();
    assert!(listed[0].last_message.is_none());
}

#[tokio::test]
async fn attachments_set_has_attachments() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let conv = direct(&messaging, u1, u2).await;

    let plain = messaging.send_message(conv, u1, "no files", vec![]).await.unwrap();
    assert!(!plain.has_attachments);
    assert!(plain.attachments.is_empty());

    let with_file = messaging
        .send_message(
            conv,
            u1,
            "",
            vec![NewAttachment {
                file_path: "documents/loan-981/paystub.pdf".into(),
                file_name: "paystub.pdf".into(),
                file_size: 48_213,
                file_type: "application/pdf".into(),
            }],
        )
        .await
        .unwrap();
    assert!(with_file.has_attachments);
    assert_eq!(with_file.attachments.len(), 1);
    assert_eq!(with_file.attachments[0].message_id, with_file.id);

    let page = messaging.fetch_messages(conv, None, None).await.unwrap();
    assert!(page[0].has_attachments);
    assert_eq!(page[0].attachments[0].file_name, "paystub.pdf");
    assert!(!page[1].has_attachments);
}

#[tokio::test]
async fn send_rejects_bad_input_and_outsiders() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let outsider = add_user(&messaging, "Casey");
    let conv = direct(&messaging, u1, u2).await;

    let empty = messaging.send_message(conv, u1, "   ", vec![]).await;
    assert!(matches!(empty, Err(MessagingError::Invalid(_))));

    let forbidden = messaging.send_message(conv, outsider, "hi", vec![]).await;
    assert!(matches!(forbidden, Err(MessagingError::Forbidden(_))));

    let missing = messaging.send_message(Uuid::new_v4(), u1, "hi", vec![]).await;
    assert!(matches!(missing, Err(MessagingError::NotFound("conversation"))));
}

#[tokio::test]
async fn mark_read_rejects_foreign_message() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let u3 = add_user(&messaging, "Casey");
    let mine = direct(&messaging, u1, u2).await;
    let other = direct(&messaging, u1, u3).await;

    let elsewhere = messaging.send_message(other, u3, "hi", vec![]).await.unwrap();
    let result = messaging.mark_read(mine, u2, elsewhere.id).await;
    assert!(matches!(result, Err(MessagingError::NotFound("message"))));

    let result = messaging.mark_read(other, u2, elsewhere.id).await;
    assert!(matches!(result, Err(MessagingError::NotFound("participant"))));
}

#[tokio::test]
async fn realtime_bridge_delivers_hydrated_messages_until_cancelled() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let conv = direct(&messaging, u1, u2).await;
    let unrelated = direct(&messaging, u2, add_user(&messaging, "Casey")).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = messaging.subscribe_to_messages(conv, move |message| {
        let _ = tx.send(message);
    });

    messaging.send_message(unrelated, u2, "elsewhere", vec![]).await.unwrap();
    let sent = messaging.send_message(conv, u2, "Statement attached", vec![]).await.unwrap();

    let delivered = recv(&mut rx).await.expect("bridge delivery");
    assert_eq!(delivered, sent);
    assert_eq!(delivered.sender.unwrap().full_name, "Blake");

    subscription.cancel();
    messaging.send_message(conv, u1, "after cancel", vec![]).await.unwrap();
    assert!(recv(&mut rx).await.is_none());
}

#[tokio::test]
async fn directory_subscription_sees_new_conversations() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let u3 = add_user(&messaging, "Casey");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = messaging.subscribe_to_directory(u3, move |id| {
        let _ = tx.send(id);
    });

    direct(&messaging, u1, u2).await;
    let group = messaging
        .create_conversation(u1, &[u2, u3], true, Some("Refinance desk".into()))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, Some(group.id));
}

#[tokio::test]
async fn create_conversation_validates_participants() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let u3 = add_user(&messaging, "Casey");

    // Creator listed twice is deduplicated.
    let conv = messaging
        .create_conversation(u1, &[u2, u1, u2], false, None)
        .await
        .unwrap();
    assert_eq!(conv.participants.len(), 2);

    let too_many = messaging.create_conversation(u1, &[u2, u3], false, None).await;
    assert!(matches!(too_many, Err(MessagingError::Invalid(_))));

    let alone = messaging.create_conversation(u1, &[], true, None).await;
    assert!(matches!(alone, Err(MessagingError::Invalid(_))));

    let ghost = messaging
        .create_conversation(u1, &[Uuid::new_v4()], false, None)
        .await;
    assert!(matches!(ghost, Err(MessagingError::Invalid(_))));

    let group = messaging
        .create_conversation(u1, &[u2, u3], true, Some("  Underwriting  ".into()))
        .await
        .unwrap();
    assert_eq!(group.title.as_deref(), Some("Underwriting"));
    assert_eq!(group.participants.len(), 3);
}

#[tokio::test]
async fn search_matches_names_and_titles() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake Morgan");
    let u3 = add_user(&messaging, "Casey");
    direct(&messaging, u1, u2).await;
    messaging
        .create_conversation(u1, &[u2, u3], true, Some("Mortgage pipeline".into()))
        .await
        .unwrap();

    let by_name = messaging.search_conversations(u1, "morgan").await.unwrap();
    assert_eq!(by_name.len(), 1);
    assert!(!by_name[0].is_group);

    let by_title = messaging.search_conversations(u1, "MORTGAGE").await.unwrap();
    assert_eq!(by_title.len(), 1);
    assert!(by_title[0].is_group);

    assert_eq!(messaging.search_conversations(u1, "  ").await.unwrap().len(), 2);
    assert!(messaging.search_conversations(u1, "zzz").await.unwrap().is_empty());
}

#[tokio::test]
async fn unread_counts_and_stats() {
    let messaging = service();
    let u1 = add_user(&messaging, "Avery");
    let u2 = add_user(&messaging, "Blake");
    let conv = direct(&messaging, u1, u2).await;

    let first = messaging.send_message(conv, u1, "one", vec![]).await.unwrap();
    messaging.send_message(conv, u1, "two", vec![]).await.unwrap();
    messaging.send_message(conv, u2, "reply", vec![]).await.unwrap();

    assert_eq!(messaging.unread_count(conv, u2).await.unwrap(), 2);
    messaging.mark_read(conv, u2, first.id).await.unwrap();
    assert_eq!(messaging.unread_count(conv, u2).await.unwrap(), 1);

    let stats = messaging.communication_stats(u2).await.unwrap();
    assert_eq!(stats.total_conversations, 1);
    assert_eq!(stats.total_messages, 3);
    assert_eq!(stats.unread_messages, 1);
    assert_eq!(stats.conversations_today, 1);
    assert_eq!(stats.messages_by_day[0], 3);

    // Seen from a week later everything has aged out of the window.
    let later = Utc::now() + chrono::Duration::days(8);
    let stats = messaging.communication_stats_at(u2, later).await.unwrap();
    assert_eq!(stats.messages_by_day, [0; 7]);
    assert_eq!(stats.conversations_today, 0);

    let fixed = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
    let stats = messaging.communication_stats_at(u2, fixed).await.unwrap();
    assert_eq!(stats.total_messages, 3);
    assert_eq!(stats.messages_by_day, [0; 7]);
}

#[tokio::test]
async fn ensure_profile_creates_once() {
    let messaging = service();
    let id = Uuid::new_v4();

    let created = messaging.ensure_profile(id, "new@lender.test", "New Officer").await.unwrap();
    assert_eq!(created.full_name, "New Officer");

    let again = messaging.ensure_profile(id, "other@lender.test", "Renamed").await.unwrap();
    assert_eq!(again, created);

    let missing = messaging.get_user_profile(Uuid::new_v4()).await;
    assert!(matches!(missing, Err(MessagingError::NotFound("profile"))));
}
