//! End-to-end lifecycle scenarios over a file-backed state directory.

use relaybot_lifecycle::adapters::{AdapterRegistry, SendFn, SendReceipt};
use relaybot_lifecycle::config::Config;
use relaybot_lifecycle::context::MsgContext;
use relaybot_lifecycle::driver::{ActiveTurns, DispatchDriver, ReplyResolver};
use relaybot_lifecycle::outbox::{OutboxStore, ReplyPayload};
use relaybot_lifecycle::turns::{TurnStatus, TurnStore};
use relaybot_lifecycle::workers::OutboxWorker;
use relaybot_lifecycle::{Dispatcher, DispatcherOptions, MessageDb};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

fn inbound(sid: &str) -> MsgContext {
    MsgContext {
        body: Some("hello".into()),
        from: Some("user-7".into()),
        to: Some("chat-1".into()),
        originating_channel: Some("telegram".into()),
        session_key: Some("agent:telegram:chat-1".into()),
        account_id: Some("acct-1".into()),
        message_sid: Some(sid.into()),
        ..MsgContext::default()
    }
}

#[tokio::test]
async fn dedupe_decision_is_durable_on_disk() {
    let state_dir = tempfile::tempdir().expect("temp dir should be created");
    let db = MessageDb::open(state_dir.path())
        .await
        .expect("store should open");

    let first_store = TurnStore::new(db.clone());
    let admission = first_store
        .accept_turn(&inbound("msg-1"), None)
        .await
        .expect("admission should succeed");
    assert!(admission.accepted);
    drop(first_store);

    // A later handle over the same state directory sees the persisted row
    // and rejects the replayed message without any in-process cache.
    let later_db = MessageDb::open(state_dir.path())
        .await
        .expect("store should reopen");
    let later_store = TurnStore::new(later_db);
    let replay = later_store
        .accept_turn(&inbound("msg-1"), None)
        .await
        .expect("replay admission should succeed");
    assert!(!replay.accepted);

    // The row really is in the file, not just in the shared pool: read it
    // back over an independent connection.
    let raw_pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!(
            "sqlite:{}",
            state_dir.path().join("message-lifecycle.db").display()
        ))
        .await
        .expect("raw connection should open");
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_turns")
        .fetch_one(&raw_pool)
        .await
        .expect("count should succeed");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn gateway_turn_converges_through_the_outbox_worker() {
    let db = MessageDb::open_in_memory()
        .await
        .expect("in-memory store should open");
    let turns = TurnStore::new(db.clone());
    let outbox = OutboxStore::new(db.clone());
    let driver = DispatchDriver::new(
        turns.clone(),
        outbox.clone(),
        AdapterRegistry::new(),
        ActiveTurns::new(),
        Config::default().into_handle(),
    );

    // Gateway-mode dispatcher: finals land in the outbox, nothing is sent
    // live, and the driver leaves the turn in delivery_pending.
    let resolver: ReplyResolver = Arc::new(|_ctx, dispatcher| {
        Box::pin(async move {
            dispatcher
                .send_final_reply(vec![ReplyPayload::text("queued reply")])
                .await?;
            Ok(())
        })
    });
    let outcome = driver
        .dispatch_inbound_message(
            inbound("msg-gw"),
            Dispatcher::new(DispatcherOptions {
                outbox: Some(outbox.clone()),
                ..DispatcherOptions::default()
            }),
            resolver,
        )
        .await
        .expect("dispatch should succeed");
    let turn_id = outcome.turn_id.expect("turn was admitted");
    assert_eq!(
        turns.status_of(&turn_id).await.expect("query ok"),
        Some(TurnStatus::DeliveryPending)
    );

    // The outbox-worker independently drains the row and, as the last
    // terminal write for the turn, finalizes it.
    let sends = Arc::new(AtomicU32::new(0));
    let counter = sends.clone();
    let deliver: SendFn = Arc::new(move |payload| {
        assert_eq!(payload.channel, "telegram");
        assert_eq!(payload.to, "chat-1");
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(SendReceipt::default()) })
    });
    let state_dir = tempfile::tempdir().expect("temp dir should be created");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker = OutboxWorker::new(
        outbox.clone(),
        deliver,
        Config::default().into_handle(),
        state_dir.path().to_path_buf(),
        shutdown_rx,
    );

    // The row predates the worker's startup cutoff, so the very first
    // pass delivers it.
    let report = worker.pass().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(sends.load(Ordering::SeqCst), 1);
    assert_eq!(
        turns.status_of(&turn_id).await.expect("query ok"),
        Some(TurnStatus::Delivered)
    );
}
