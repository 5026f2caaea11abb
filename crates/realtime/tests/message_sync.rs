#![allow(clippy::unwrap_used)]

mod common;

use std::sync::atomic::Ordering;

use helpdesk_realtime::chat::{DeliveryState, Draft};
use helpdesk_realtime::{ConversationUpdate, MessageSynchronizer, NoticeKind, SyncError};
use helpdesk_shared::{MessageId, MessageStore, NewMessage};

use common::{agent, conversation, end_user, FlakyStore};

fn drain(
    updates: &mut tokio::sync::mpsc::UnboundedReceiver<ConversationUpdate>,
) -> Vec<ConversationUpdate> {
    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update);
    }
    seen
}

#[tokio::test]
async fn test_rejected_send_is_rolled_back() {
    let store = FlakyStore::new();
    FlakyStore::set(&store.fail_inserts, true);
    let (sync, mut updates) =
        MessageSynchronizer::new(conversation(), agent("Alex"), store.backends());

    let pending = sync.send(Draft::text("Will this land?")).await.unwrap();
    let temp_id = pending.temp_id.clone();
    assert!(temp_id.is_temporary());
    assert_eq!(sync.messages().len(), 1);

    pending.settled().await;

    assert!(sync.messages().is_empty());
    let seen = drain(&mut updates);
    assert!(matches!(&seen[0], ConversationUpdate::Added(m) if m.id == temp_id));
    assert_eq!(seen[1], ConversationUpdate::Removed { id: temp_id });
    match &seen[2] {
        ConversationUpdate::Notice(notice) => assert_eq!(notice.kind, NoticeKind::Dismissible),
        other => panic!("expected notice, got {other:?}"),
    }
}

#[tokio::test]
async fn test_activity_failure_does_not_fail_send() {
    let store = FlakyStore::new();
    FlakyStore::set(&store.fail_activity, true);
    let conv = conversation();
    let (sync, mut updates) = MessageSynchronizer::new(conv, agent("Alex"), store.backends());

    sync.send(Draft::text("Still delivered"))
        .await
        .unwrap()
        .settled()
        .await;

    let entries = sync.snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, DeliveryState::Confirmed);
    assert!(!entries[0].message.id.is_temporary());
    assert!(store.inner.activity(conv.ticket_id).is_empty());
    assert!(drain(&mut updates)
        .iter()
        .all(|u| !matches!(u, ConversationUpdate::Notice(_))));
}

#[tokio::test]
async fn test_sends_never_render_twice() {
    let store = FlakyStore::new();
    let (sync, _updates) =
        MessageSynchronizer::new(conversation(), agent("Alex"), store.backends());

    let mut pending = Vec::new();
    for body in ["one", "two", "three"] {
        pending.push(sync.send(Draft::text(body)).await.unwrap());
    }
    for send in pending {
        send.settled().await;
    }

    let messages = sync.messages();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| !m.id.is_temporary()));
    let mut bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
    bodies.sort_unstable();
    assert_eq!(bodies, vec!["one", "three", "two"]);
}

async fn confirmed_message(
    store: &FlakyStore,
    sync: &MessageSynchronizer,
    body: &str,
) -> uuid::Uuid {
    let pending = sync.send(Draft::text(body)).await.unwrap();
    pending.settled().await;
    let id = sync.messages()[0].id.server_id().unwrap();
    assert!(store
        .inner
        .messages(sync.conversation().id)
        .iter()
        .any(|m| m.id == MessageId::Server(id)));
    id
}

#[tokio::test]
async fn test_edit_falls_back_to_body_only() {
    let store = FlakyStore::new();
    FlakyStore::set(&store.legacy_edit_columns, true);
    let (sync, _updates) =
        MessageSynchronizer::new(conversation(), agent("Alex"), store.backends());
    let id = confirmed_message(&store, &sync, "Teh printer").await;

    let edited = sync.edit(id, "The printer").await.unwrap();

    assert!(edited.edited);
    assert!(edited.edited_at.is_some());
    assert_eq!(store.edit_attempts.load(Ordering::SeqCst), 2);
    let stored = store.inner.messages(sync.conversation().id);
    assert_eq!(stored[0].body, "The printer");
    // Body-only writes leave the stored edit flags alone
    assert!(!stored[0].edited);
}

#[tokio::test]
async fn test_failed_edit_is_rolled_back() {
    let store = FlakyStore::new();
    let (sync, mut updates) =
        MessageSynchronizer::new(conversation(), agent("Alex"), store.backends());
    let id = confirmed_message(&store, &sync, "Original").await;
    drain(&mut updates);

    FlakyStore::set(&store.fail_edits, true);
    let err = sync.edit(id, "Changed").await.unwrap_err();

    assert!(matches!(err, SyncError::Persistence(_)));
    assert!(err.is_retryable());
    let message = &sync.messages()[0];
    assert_eq!(message.body, "Original");
    assert!(!message.edited);

    let seen = drain(&mut updates);
    assert_eq!(seen.len(), 2);
    assert!(matches!(&seen[0], ConversationUpdate::Updated(m) if m.body == "Changed"));
    assert!(matches!(&seen[1], ConversationUpdate::Updated(m) if m.body == "Original"));
}

#[tokio::test]
async fn test_history_load_skips_known_messages() {
    let store = FlakyStore::new();
    let conv = conversation();
    let customer = end_user("Sam");

    for body in ["first", "second"] {
        store
            .insert_message(&NewMessage {
                conversation_id: conv.id,
                author_id: customer.id,
                author_name: customer.name.clone(),
                author_role: customer.role,
                body: body.to_string(),
                attachments: vec![],
                audio_url: None,
                audio_duration_secs: None,
                reply_to: None,
            })
            .await
            .unwrap();
    }

    let (sync, _updates) = MessageSynchronizer::new(conv, agent("Alex"), store.backends());
    assert_eq!(sync.load_history().await.unwrap(), 2);
    assert_eq!(sync.load_history().await.unwrap(), 0);
    assert_eq!(sync.messages().len(), 2);
    assert!(sync
        .snapshot()
        .iter()
        .all(|e| e.state == DeliveryState::Confirmed));
}
