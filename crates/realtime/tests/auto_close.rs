#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use time::macros::datetime;

use helpdesk_realtime::realtime::{tables, RecordChange};
use helpdesk_realtime::{AutoCloseOutcome, AutoCloseScheduler, Clock, LocalPushHub, ManualClock};
use helpdesk_shared::{
    ActivityStore, InMemoryStore, NewActivity, TicketId, TicketLifecycle, TicketStatus, UserId,
};

use common::{manager, settle};

fn resolved_ticket(resolved_at: time::OffsetDateTime) -> TicketLifecycle {
    TicketLifecycle {
        ticket_id: TicketId::new(),
        status: TicketStatus::Resolved,
        resolved_at: Some(resolved_at),
        closed_at: None,
        reopen_count: 0,
    }
}

fn close_activities(store: &InMemoryStore, ticket_id: TicketId) -> usize {
    store
        .activity(ticket_id)
        .into_iter()
        .filter(|a| a.activity_type == "closed")
        .count()
}

#[tokio::test]
async fn test_manual_close_before_expiry_wins() {
    let resolved_at = datetime!(2025-03-01 10:00:00 UTC);
    // 23:59:00 into a 24 hour grace period
    let clock = Arc::new(ManualClock::new(datetime!(2025-03-02 09:59:00 UTC)));
    let store = Arc::new(InMemoryStore::new());
    let ticket = resolved_ticket(resolved_at);
    store.put_ticket(ticket.clone());

    let scheduler =
        AutoCloseScheduler::with_clock(store.clone(), store.clone(), 24, clock.clone());
    scheduler.set_tickets(vec![ticket.clone()]);
    assert_eq!(scheduler.remaining(ticket.ticket_id), Some(60));

    clock.advance(Duration::from_secs(1));
    assert!(scheduler.tick().await.is_empty());
    assert_eq!(scheduler.remaining(ticket.ticket_id), Some(59));

    // An agent closes the ticket by hand; this client has not seen the push
    let mut closed = ticket.clone();
    closed.status = TicketStatus::Closed;
    closed.closed_at = Some(clock.now());
    store.put_ticket(closed);
    store
        .record_activity(&NewActivity {
            ticket_id: ticket.ticket_id,
            activity_type: "closed".to_string(),
            actor_id: Some(UserId::new()),
            description: "Ticket closed".to_string(),
        })
        .await
        .unwrap();

    clock.advance(Duration::from_secs(60));
    let results = scheduler.tick().await;
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].1.as_ref().unwrap(),
        &AutoCloseOutcome::AlreadyChanged
    );
    assert!(scheduler.countdowns().is_empty());
    assert_eq!(close_activities(&store, ticket.ticket_id), 1);
}

#[tokio::test]
async fn test_two_clients_close_once() {
    let resolved_at = datetime!(2025-03-01 10:00:00 UTC);
    let clock = Arc::new(ManualClock::new(datetime!(2025-03-02 10:00:00 UTC)));
    let store = Arc::new(InMemoryStore::new());
    let ticket = resolved_ticket(resolved_at);
    store.put_ticket(ticket.clone());

    let first = AutoCloseScheduler::with_clock(store.clone(), store.clone(), 24, clock.clone());
    let second = AutoCloseScheduler::with_clock(store.clone(), store.clone(), 24, clock.clone());
    first.set_tickets(vec![ticket.clone()]);
    second.set_tickets(vec![ticket.clone()]);

    let (a, b) = tokio::join!(first.tick(), second.tick());
    let outcomes: Vec<AutoCloseOutcome> = a
        .into_iter()
        .chain(b)
        .map(|(_, result)| result.unwrap())
        .collect();

    let closed = outcomes
        .iter()
        .filter(|o| matches!(o, AutoCloseOutcome::Closed(_)))
        .count();
    assert_eq!(closed, 1);
    assert_eq!(
        store.ticket(ticket.ticket_id).unwrap().status,
        TicketStatus::Closed
    );
    assert_eq!(close_activities(&store, ticket.ticket_id), 1);
}

#[tokio::test]
async fn test_reopened_ticket_push_cancels_countdown() {
    let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 12:00:00 UTC)));
    let store = Arc::new(InMemoryStore::new());
    let hub = LocalPushHub::new();
    let manager = manager(&hub);
    let ticket = resolved_ticket(datetime!(2025-03-01 10:00:00 UTC));

    let scheduler =
        AutoCloseScheduler::with_clock(store.clone(), store.clone(), 24, clock.clone());
    scheduler.attach(&manager, "agent-dashboard").await;
    scheduler.set_tickets(vec![ticket.clone()]);
    assert_eq!(scheduler.remaining(ticket.ticket_id), Some(22 * 3600));

    hub.publish(RecordChange::update(
        tables::TICKETS,
        json!({
            "id": ticket.ticket_id,
            "status": "open",
            "resolved_at": null,
            "closed_at": null,
            "reopen_count": 1,
        }),
    ));
    settle().await;
    assert!(scheduler.countdowns().is_empty());

    // Resolving again starts a fresh countdown from the new timestamp
    hub.publish(RecordChange::update(
        tables::TICKETS,
        json!({
            "id": ticket.ticket_id,
            "status": "resolved",
            "resolved_at": "2025-03-01T12:00:00Z",
            "closed_at": null,
            "reopen_count": 1,
        }),
    ));
    settle().await;
    assert_eq!(scheduler.remaining(ticket.ticket_id), Some(24 * 3600));

    scheduler.shutdown(Some(&manager)).await;
    assert!(scheduler.countdowns().is_empty());
    assert_eq!(manager.stats().await.total, 0);
}
