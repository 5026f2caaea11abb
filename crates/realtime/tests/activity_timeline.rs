#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use helpdesk_realtime::activity::ActivityKind;
use helpdesk_realtime::realtime::{tables, RecordChange};
use helpdesk_realtime::{ActivityTimeline, Deduplicator, LocalPushHub, WindowMode};
use helpdesk_shared::{InMemoryStore, TicketId, UserId};

use common::{manager, settle};

fn activity(ticket_id: TicketId, actor: UserId, description: &str, at: &str) -> RecordChange {
    RecordChange::insert(
        tables::ACTIVITY,
        json!({
            "id": Uuid::new_v4(),
            "ticket_id": ticket_id,
            "activity_type": "status_changed",
            "actor_id": actor,
            "description": description,
            "created_at": at,
        }),
    )
}

#[tokio::test]
async fn test_distinct_status_changes_survive_window() {
    let hub = LocalPushHub::new();
    let manager = manager(&hub);
    let ticket_id = TicketId::new();
    let agent = UserId::new();

    let timeline = ActivityTimeline::new(
        ticket_id,
        Arc::new(InMemoryStore::new()),
        Deduplicator::new(Duration::from_secs(2)),
    );
    timeline.attach(&manager).await;

    let pushes = [
        ("Status changed from open to pending", "2025-03-01T10:00:00Z"),
        ("Status changed from pending to open", "2025-03-01T10:00:01Z"),
        ("Status changed from open to resolved", "2025-03-01T10:00:02Z"),
        // Same transition fired twice by the trigger
        ("Status changed from open to resolved", "2025-03-01T10:00:03Z"),
    ];
    for (description, at) in pushes {
        hub.publish(activity(ticket_id, agent, description, at));
    }
    settle().await;

    let events = timeline.current();
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .all(|e| matches!(e.kind, ActivityKind::StatusChanged { .. })));
    assert_eq!(
        events.last().unwrap().description,
        "Status changed from open to resolved"
    );

    timeline.detach(&manager).await;
}

#[tokio::test]
async fn test_pushes_for_other_tickets_are_filtered() {
    let hub = LocalPushHub::new();
    let manager = manager(&hub);
    let ticket_id = TicketId::new();
    let agent = UserId::new();

    let timeline = ActivityTimeline::new(
        ticket_id,
        Arc::new(InMemoryStore::new()),
        Deduplicator::default(),
    );
    timeline.attach(&manager).await;

    hub.publish(activity(
        TicketId::new(),
        agent,
        "elsewhere",
        "2025-03-01T10:00:00Z",
    ));
    hub.publish(activity(ticket_id, agent, "here", "2025-03-01T10:00:00Z"));
    settle().await;

    let events = timeline.current();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].description, "here");
}

#[tokio::test]
async fn test_loaded_and_pushed_events_merge() {
    let store = Arc::new(InMemoryStore::new());
    let hub = LocalPushHub::new();
    let manager = manager(&hub);
    let ticket_id = TicketId::new();
    let agent = UserId::new();

    let stored = activity(ticket_id, agent, "stored", "2025-03-01T09:00:00Z");
    store.put_activity(stored.decode().unwrap());

    let timeline = ActivityTimeline::new(
        ticket_id,
        store,
        Deduplicator::new(Duration::from_secs(5)).with_mode(WindowMode::FixedBucket),
    );
    timeline.attach(&manager).await;
    assert_eq!(timeline.load().await.unwrap().len(), 1);

    // The stored event arriving again by push is not shown twice
    hub.publish(stored);
    hub.publish(activity(ticket_id, agent, "live", "2025-03-01T10:00:00Z"));
    settle().await;

    let descriptions: Vec<String> = timeline
        .current()
        .into_iter()
        .map(|e| e.description)
        .collect();
    assert_eq!(descriptions, vec!["stored", "live"]);
}
