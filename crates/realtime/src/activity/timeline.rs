//! Live activity timeline for one ticket

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use helpdesk_shared::{ActivityRecord, ActivityStore, TicketId};

use super::dedup::Deduplicator;
use super::kind::ActivityEvent;
use crate::error::SyncResult;
use crate::realtime::{
    tables, ChangeKind, ConnectionManager, EventFilter, RecordChange, ResourceKey,
    SubscriptionHandle,
};

struct TimelineState {
    dedup: Deduplicator,
    /// Raw events by id; pushes are at-least-once
    raw: Mutex<HashMap<Uuid, ActivityEvent>>,
    published: watch::Sender<Vec<ActivityEvent>>,
}

impl TimelineState {
    fn raw(&self) -> MutexGuard<'_, HashMap<Uuid, ActivityEvent>> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn republish(&self) {
        let events: Vec<ActivityEvent> = self.raw().values().cloned().collect();
        self.published.send_replace(self.dedup.dedupe(&events));
    }

    fn ingest(&self, event: ActivityEvent) {
        self.raw().insert(event.id, event);
        self.republish();
    }
}

/// Deduplicated, timestamp-ordered activity of a ticket
pub struct ActivityTimeline {
    ticket_id: TicketId,
    store: Arc<dyn ActivityStore>,
    state: Arc<TimelineState>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl ActivityTimeline {
    pub fn new(ticket_id: TicketId, store: Arc<dyn ActivityStore>, dedup: Deduplicator) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            ticket_id,
            store,
            state: Arc::new(TimelineState {
                dedup,
                raw: Mutex::new(HashMap::new()),
                published,
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Fetch the stored activity and publish the deduplicated list
    pub async fn load(&self) -> SyncResult<Vec<ActivityEvent>> {
        let records = self.store.list_activity(self.ticket_id).await?;
        let count = records.len();

        {
            let mut raw = self.state.raw();
            for record in records {
                let event = ActivityEvent::from(record);
                raw.insert(event.id, event);
            }
        }
        self.state.republish();

        let events = self.current();
        tracing::debug!(
            ticket_id = %self.ticket_id,
            fetched = count,
            kept = events.len(),
            "Loaded activity timeline"
        );
        Ok(events)
    }

    /// Follow new activity through the connection manager
    pub async fn attach(&self, manager: &ConnectionManager) {
        let state = Arc::clone(&self.state);
        let ticket_id = self.ticket_id;
        let filter = EventFilter::table(tables::ACTIVITY)
            .on(ChangeKind::Insert)
            .eq("ticket_id", ticket_id);

        let handle = manager
            .subscribe(
                ResourceKey::ticket_activity(ticket_id),
                filter,
                move |change: RecordChange| match change.decode::<ActivityRecord>() {
                    Ok(record) => state.ingest(ActivityEvent::from(record)),
                    Err(e) => {
                        tracing::warn!(ticket_id = %ticket_id, error = %e, "Malformed activity push");
                    }
                },
            )
            .await;

        *self.subscription() = Some(handle);
    }

    pub async fn detach(&self, manager: &ConnectionManager) {
        let handle = self.subscription().take();
        if let Some(handle) = handle {
            manager.unsubscribe(&handle).await;
        }
    }

    /// Add an event recorded locally, ahead of its push
    pub fn ingest(&self, record: ActivityRecord) {
        self.state.ingest(ActivityEvent::from(record));
    }

    pub fn current(&self) -> Vec<ActivityEvent> {
        self.state.published.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<ActivityEvent>> {
        self.state.published.subscribe()
    }

    fn subscription(&self) -> MutexGuard<'_, Option<SubscriptionHandle>> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
