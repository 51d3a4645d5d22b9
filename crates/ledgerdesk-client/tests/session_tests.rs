use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use ledgerdesk_api::{AppStateInner, Messaging, router};
use ledgerdesk_client::{ClientError, Delivery, Gateway, HttpBackend, ReadPosition, Session};
use ledgerdesk_db::Database;
use ledgerdesk_realtime::ChangeFeed;

const PASSWORD: &str = "correct horse battery";

/// Serve the full router on an ephemeral port and return its base URL.
async fn spawn_server() -> String {
    let db = Database::open_in_memory().expect("in-memory db");
    let state = Arc::new(AppStateInner {
        messaging: Messaging::new(Arc::new(db), ChangeFeed::new()),
        jwt_secret: "session-test-secret".to_string(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn sign_in_send_and_read_round_trip() {
    let base = spawn_server().await;

    let mut officer = Session::new(HttpBackend::new(&base));
    officer.register("officer@lender.test", PASSWORD, "Loan Officer").await.unwrap();
    let officer_id = officer.user_id().unwrap();

    let mut borrower = Session::new(HttpBackend::new(&base));
    borrower.register("borrower@mail.test", PASSWORD, "Jordan Borrower").await.unwrap();
    let borrower_id = borrower.user_id().unwrap();

    // Fresh session against the same account.
    borrower.sign_out();
    let profile = borrower.sign_in("borrower@mail.test", PASSWORD).await.unwrap();
    assert_eq!(profile.full_name, "Jordan Borrower");
    assert_eq!(borrower.user_id().unwrap(), borrower_id);

    let conversation = officer.start_conversation(borrower_id).await.unwrap();
    let mut officer_thread = officer.open_thread(&conversation, None).await.unwrap();
    assert!(officer_thread.entries().is_empty());

    let sent = officer.send_in_thread(&mut officer_thread, "Hello").await.unwrap();
    assert_eq!(officer_thread.entries().len(), 1);
    assert_eq!(officer_thread.entries()[0].delivery, Delivery::Confirmed { id: sent.id });
    assert_eq!(sent.sender_id, officer_id);

    let listed = borrower.conversations().await.unwrap();
    assert_eq!(listed.len(), 1);
    let mut borrower_thread = borrower.open_thread(&listed[0], Some(10)).await.unwrap();
    assert_eq!(borrower_thread.entries()[0].content, "Hello");
    assert_eq!(
        borrower.http().unread_count(borrower.token().unwrap(), conversation.id).await.unwrap(),
        1
    );

    let marked = borrower.mark_thread_read(&mut borrower_thread).await.unwrap();
    assert_eq!(marked, Some(sent.id));
    assert_eq!(borrower.mark_thread_read(&mut borrower_thread).await.unwrap(), None);
    assert_eq!(
        borrower.http().unread_count(borrower.token().unwrap(), conversation.id).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn rejected_send_rolls_back_pending_entry() {
    let base = spawn_server().await;
    let mut officer = Session::new(HttpBackend::new(&base));
    officer.register("officer@lender.test", PASSWORD, "Loan Officer").await.unwrap();
    let mut borrower = Session::new(HttpBackend::new(&base));
    borrower.register("borrower@mail.test", PASSWORD, "Jordan Borrower").await.unwrap();

    let conversation = officer.start_conversation(borrower.user_id().unwrap()).await.unwrap();
    let mut thread = officer.open_thread(&conversation, None).await.unwrap();

    let err = officer.send_in_thread(&mut thread, "   ").await.unwrap_err();
    assert_eq!(err.status(), Some(reqwest::StatusCode::BAD_REQUEST));
    assert!(thread.entries().is_empty());
}

#[tokio::test]
async fn watch_delivers_until_sign_out() {
    let base = spawn_server().await;
    let mut officer = Session::new(HttpBackend::new(&base));
    officer.register("officer@lender.test", PASSWORD, "Loan Officer").await.unwrap();
    let mut borrower = Session::new(HttpBackend::new(&base));
    borrower.register("borrower@mail.test", PASSWORD, "Jordan Borrower").await.unwrap();

    let conversation = officer.start_conversation(borrower.user_id().unwrap()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    borrower
        .watch(conversation.id, move |message| {
            let _ = tx.send(message);
        })
        .await
        .unwrap();
    assert_eq!(borrower.active_watches(), 1);

    let mut thread = officer.open_thread(&conversation, None).await.unwrap();
    let sent = officer.send_in_thread(&mut thread, "Docs are in").await.unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("realtime delivery")
        .expect("listener alive");
    assert_eq!(pushed.id, sent.id);
    assert_eq!(pushed.content, "Docs are in");
    assert_eq!(pushed.sender.map(|s| s.full_name), Some("Loan Officer".to_string()));

    assert!(borrower.sign_out());
    assert_eq!(borrower.active_watches(), 0);
    assert!(matches!(borrower.token(), Err(ClientError::NotSignedIn)));

    officer.send_in_thread(&mut thread, "Anyone there?").await.unwrap();
    // The listener was dropped with the gateway, closing the channel.
    let after = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(matches!(after, Ok(None) | Err(_)));
}

#[tokio::test]
async fn outsiders_cannot_watch() {
    let base = spawn_server().await;
    let mut officer = Session::new(HttpBackend::new(&base));
    officer.register("officer@lender.test", PASSWORD, "Loan Officer").await.unwrap();
    let mut borrower = Session::new(HttpBackend::new(&base));
    borrower.register("borrower@mail.test", PASSWORD, "Jordan Borrower").await.unwrap();
    let mut outsider = Session::new(HttpBackend::new(&base));
    outsider.register("outsider@mail.test", PASSWORD, "Someone Else").await.unwrap();

    let conversation = officer.start_conversation(borrower.user_id().unwrap()).await.unwrap();

    let err = outsider.watch(conversation.id, |_| {}).await.unwrap_err();
    assert!(matches!(err, ClientError::Refused(id) if id == conversation.id));
    assert_eq!(outsider.active_watches(), 0);
}

#[tokio::test]
async fn concurrent_refused_subscriptions_all_fail() {
    let base = spawn_server().await;
    let mut officer = Session::new(HttpBackend::new(&base));
    officer.register("officer@lender.test", PASSWORD, "Loan Officer").await.unwrap();
    let mut borrower = Session::new(HttpBackend::new(&base));
    borrower.register("borrower@mail.test", PASSWORD, "Jordan Borrower").await.unwrap();
    let mut outsider = Session::new(HttpBackend::new(&base));
    outsider.register("outsider@mail.test", PASSWORD, "Someone Else").await.unwrap();

    let conversation = officer.start_conversation(borrower.user_id().unwrap()).await.unwrap();

    let http = HttpBackend::new(&base);
    let gateway = Gateway::connect(&http.gateway_url(outsider.token().unwrap())).await.unwrap();
    let (first, second) = tokio::join!(
        gateway.subscribe(conversation.id, |_| {}),
        gateway.subscribe(conversation.id, |_| {}),
    );

    assert!(matches!(first, Err(ClientError::Refused(id)) if id == conversation.id));
    assert!(matches!(second, Err(ClientError::Refused(id)) if id == conversation.id));
    assert_eq!(gateway.listener_count(), 0);
}

#[tokio::test]
async fn concurrent_accepted_subscriptions_both_deliver() {
    let base = spawn_server().await;
    let mut officer = Session::new(HttpBackend::new(&base));
    officer.register("officer@lender.test", PASSWORD, "Loan Officer").await.unwrap();
    let mut borrower = Session::new(HttpBackend::new(&base));
    borrower.register("borrower@mail.test", PASSWORD, "Jordan Borrower").await.unwrap();

    let conversation = officer.start_conversation(borrower.user_id().unwrap()).await.unwrap();

    let gateway = Gateway::connect(&borrower.http().gateway_url(borrower.token().unwrap()))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx2 = tx.clone();
    let (first, second) = tokio::join!(
        gateway.subscribe(conversation.id, move |m| {
            let _ = tx.send(m.id);
        }),
        gateway.subscribe(conversation.id, move |m| {
            let _ = tx2.send(m.id);
        }),
    );
    assert!(first.is_ok() && second.is_ok());
    assert_eq!(gateway.listener_count(), 2);

    let mut thread = officer.open_thread(&conversation, None).await.unwrap();
    let sent = officer.send_in_thread(&mut thread, "Rate locked").await.unwrap();
    for _ in 0..2 {
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got, Some(sent.id));
    }
}

#[tokio::test]
async fn hooks_surface_read_receipts_and_new_conversations() {
    let base = spawn_server().await;
    let mut officer = Session::new(HttpBackend::new(&base));
    officer.register("officer@lender.test", PASSWORD, "Loan Officer").await.unwrap();
    let mut borrower = Session::new(HttpBackend::new(&base));
    borrower.register("borrower@mail.test", PASSWORD, "Jordan Borrower").await.unwrap();
    let borrower_id = borrower.user_id().unwrap();

    let conversation = officer.start_conversation(borrower_id).await.unwrap();

    // Officer hears read receipts for the conversation they watch.
    let (read_tx, mut read_rx) = mpsc::unbounded_channel();
    officer
        .on_read_position(move |position| {
            let _ = read_tx.send(position);
        })
        .await
        .unwrap();
    officer.watch(conversation.id, |_| {}).await.unwrap();

    // The acknowledged watch means the borrower's directory feed is live too.
    let (created_tx, mut created_rx) = mpsc::unbounded_channel();
    borrower
        .on_conversation_created(move |id| {
            let _ = created_tx.send(id);
        })
        .await
        .unwrap();
    borrower.watch(conversation.id, |_| {}).await.unwrap();

    let mut thread = officer.open_thread(&conversation, None).await.unwrap();
    let sent = officer.send_in_thread(&mut thread, "Please review").await.unwrap();
    borrower
        .http()
        .mark_read(borrower.token().unwrap(), conversation.id, sent.id)
        .await
        .unwrap();

    let position = tokio::time::timeout(Duration::from_secs(5), read_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        position,
        ReadPosition {
            conversation_id: conversation.id,
            user_id: borrower_id,
            message_id: sent.id,
        }
    );

    let group = officer
        .http()
        .create_conversation(
            officer.token().unwrap(),
            vec![borrower_id],
            true,
            Some("Closing docs".to_string()),
        )
        .await
        .unwrap();
    let created = tokio::time::timeout(Duration::from_secs(5), created_rx.recv())
        .await
        .unwrap();
    assert_eq!(created, Some(group.id));
}
