//! Auto-Close Sweeper
//!
//! Keeps a server-side auto-close scheduler fed with the resolved tickets and
//! the current grace period. Clients may run their own schedulers at the same
//! time; the store-level compare-and-set keeps the close single.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use helpdesk_realtime::{AutoCloseScheduler, AutoCloseSettings};
use helpdesk_shared::{ActivityStore, SettingsStore, StoreResult, TicketStore};

pub struct Sweeper<S> {
    store: Arc<S>,
    scheduler: AutoCloseScheduler,
    default_hours: u32,
    refresh_interval: Duration,
}

impl<S> Sweeper<S>
where
    S: TicketStore + ActivityStore + SettingsStore + 'static,
{
    pub fn new(store: Arc<S>, default_hours: u32, refresh_interval: Duration) -> Self {
        let scheduler = AutoCloseScheduler::new(store.clone(), store.clone(), default_hours);
        Self::with_scheduler(store, scheduler, default_hours, refresh_interval)
    }

    pub fn with_scheduler(
        store: Arc<S>,
        scheduler: AutoCloseScheduler,
        default_hours: u32,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            default_hours,
            refresh_interval,
        }
    }

    pub fn scheduler(&self) -> &AutoCloseScheduler {
        &self.scheduler
    }

    /// Re-read the grace period and the resolved tickets
    pub async fn refresh(&self) -> StoreResult<usize> {
        let settings = AutoCloseSettings::resolve(self.store.as_ref(), self.default_hours).await;
        self.scheduler.set_duration_hours(settings.hours);

        let resolved = self.store.list_resolved().await?;
        self.scheduler.set_tickets(resolved);

        Ok(self.scheduler.countdowns().len())
    }

    /// Tick the scheduler and refresh periodically until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.scheduler.start();
        info!(
            default_hours = self.default_hours,
            refresh_secs = self.refresh_interval.as_secs(),
            "Auto-close sweeper started"
        );

        let mut interval = tokio::time::interval(self.refresh_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => match self.refresh().await {
                    Ok(tracked) => info!(tracked, "Resolved tickets refreshed"),
                    Err(e) => error!(error = %e, "Failed to refresh resolved tickets"),
                },
            }
        }

        self.scheduler.shutdown(None).await;
        info!("Auto-close sweeper stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use helpdesk_realtime::ManualClock;
    use helpdesk_shared::{InMemoryStore, TicketId, TicketLifecycle, TicketStatus};
    use time::macros::datetime;

    fn resolved(at: time::OffsetDateTime) -> TicketLifecycle {
        TicketLifecycle {
            ticket_id: TicketId::new(),
            status: TicketStatus::Resolved,
            resolved_at: Some(at),
            closed_at: None,
            reopen_count: 0,
        }
    }

    fn sweeper(store: &Arc<InMemoryStore>, clock: &Arc<ManualClock>) -> Sweeper<InMemoryStore> {
        let scheduler =
            AutoCloseScheduler::with_clock(store.clone(), store.clone(), 24, clock.clone());
        Sweeper::with_scheduler(store.clone(), scheduler, 24, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_refresh_tracks_resolved_tickets() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 12:00:00 UTC)));
        let ticket = resolved(datetime!(2025-03-01 10:00:00 UTC));
        store.put_ticket(ticket.clone());
        let mut open = resolved(datetime!(2025-03-01 10:00:00 UTC));
        open.status = TicketStatus::Open;
        store.put_ticket(open);

        let sweeper = sweeper(&store, &clock);
        assert_eq!(sweeper.refresh().await.unwrap(), 1);
        assert_eq!(
            sweeper.scheduler().remaining(ticket.ticket_id),
            Some(22 * 3600)
        );
    }

    #[tokio::test]
    async fn test_refresh_picks_up_setting_change() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 12:00:00 UTC)));
        let ticket = resolved(datetime!(2025-03-01 10:00:00 UTC));
        store.put_ticket(ticket.clone());
        store.set_setting("auto_close_hours", "48");

        let sweeper = sweeper(&store, &clock);
        sweeper.refresh().await.unwrap();
        assert_eq!(
            sweeper.scheduler().remaining(ticket.ticket_id),
            Some(46 * 3600)
        );

        // Invalid values fall back to the default
        store.set_setting("auto_close_hours", "0");
        sweeper.refresh().await.unwrap();
        assert_eq!(
            sweeper.scheduler().remaining(ticket.ticket_id),
            Some(22 * 3600)
        );
    }

    #[tokio::test]
    async fn test_expired_ticket_closed_by_sweep() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-02 10:00:05 UTC)));
        let ticket = resolved(datetime!(2025-03-01 10:00:00 UTC));
        store.put_ticket(ticket.clone());

        let sweeper = sweeper(&store, &clock);
        sweeper.refresh().await.unwrap();
        let results = sweeper.scheduler().tick().await;

        assert_eq!(results.len(), 1);
        assert_eq!(
            store.ticket(ticket.ticket_id).unwrap().status,
            TicketStatus::Closed
        );
        let activity = store.activity(ticket.ticket_id);
        assert_eq!(activity.len(), 1);
        assert_eq!(
            activity[0].description,
            "Ticket automatically closed after 24 hours"
        );
        assert!(activity[0].actor_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 12:00:00 UTC)));
        store.put_ticket(resolved(datetime!(2025-03-01 10:00:00 UTC)));

        let sweeper = sweeper(&store, &clock);
        sweeper
            .run(tokio::time::sleep(Duration::from_secs(90)))
            .await;

        assert!(sweeper.scheduler().countdowns().is_empty());
    }
}
