//! Auto-close scheduling
//!
//! Derives a per-ticket countdown from the server-stored `resolved_at` and
//! the configured grace period, and requests the close exactly once when a
//! countdown reaches zero. The close itself is a compare-and-set in the
//! store, so clients racing each other (or an agent closing manually) never
//! produce a second close.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use helpdesk_shared::{
    ActivityStore, CloseOutcome, NewActivity, TicketId, TicketLifecycle, TicketStore,
};

use crate::backoff::ReconnectPolicy;
use crate::clock::{Clock, SystemClock};
use crate::error::{SyncError, SyncResult};
use crate::realtime::{
    tables, ChangeKind, ConnectionManager, EventFilter, RecordChange, ResourceKey,
    SubscriptionHandle,
};

/// `start + duration`, or `None` when that falls outside the representable range
pub fn deadline(start: OffsetDateTime, duration: Duration) -> Option<OffsetDateTime> {
    let duration = time::Duration::try_from(duration).ok()?;
    start.checked_add(duration)
}

/// Seconds left until `resolved_at + duration`, rounded up, never negative.
/// A deadline past the representable range never arrives.
pub fn remaining_seconds(
    resolved_at: OffsetDateTime,
    duration: Duration,
    now: OffsetDateTime,
) -> u64 {
    let Some(closes_at) = deadline(resolved_at, duration) else {
        return u64::MAX;
    };
    seconds_until(closes_at, now)
}

fn seconds_until(closes_at: OffsetDateTime, now: OffsetDateTime) -> u64 {
    let left = closes_at - now;
    if !left.is_positive() {
        return 0;
    }

    let whole = left.whole_seconds().max(0) as u64;
    if left.subsec_nanoseconds() > 0 {
        whole + 1
    } else {
        whole
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    pub ticket_id: TicketId,
    pub resolved_at: OffsetDateTime,
    pub closes_at: OffsetDateTime,
    pub remaining_secs: u64,
}

/// What an auto-close request achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoCloseOutcome {
    Closed(TicketLifecycle),
    /// Another actor already moved the ticket out of Resolved
    AlreadyChanged,
}

type CloseKey = (TicketId, OffsetDateTime);

/// Failed close attempts for one resolution
struct CloseRetry {
    failures: u32,
    retry_at: OffsetDateTime,
}

struct SchedulerState {
    duration: Duration,
    tickets: HashMap<TicketId, TicketLifecycle>,
    /// (ticket, resolved_at) pairs whose close was already requested
    fired: HashSet<CloseKey>,
    retries: HashMap<CloseKey, CloseRetry>,
}

struct Inner {
    tickets: Arc<dyn TicketStore>,
    activity: Arc<dyn ActivityStore>,
    clock: Arc<dyn Clock>,
    retry: ReconnectPolicy,
    state: Mutex<SchedulerState>,
    countdowns: watch::Sender<Vec<Countdown>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

#[derive(Clone)]
pub struct AutoCloseScheduler {
    inner: Arc<Inner>,
}

impl AutoCloseScheduler {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        activity: Arc<dyn ActivityStore>,
        duration_hours: u32,
    ) -> Self {
        Self::with_clock(tickets, activity, duration_hours, Arc::new(SystemClock))
    }

    pub fn with_clock(
        tickets: Arc<dyn TicketStore>,
        activity: Arc<dyn ActivityStore>,
        duration_hours: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (countdowns, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                tickets,
                activity,
                clock,
                retry: ReconnectPolicy::default(),
                state: Mutex::new(SchedulerState {
                    duration: hours(duration_hours),
                    tickets: HashMap::new(),
                    fired: HashSet::new(),
                    retries: HashMap::new(),
                }),
                countdowns,
                runner: Mutex::new(None),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Replace the tracked tickets. Countdowns are recomputed from scratch.
    pub fn set_tickets(&self, tickets: Vec<TicketLifecycle>) {
        {
            let mut state = self.inner.state();
            state.tickets = tickets
                .into_iter()
                .filter(TicketLifecycle::is_auto_close_eligible)
                .map(|t| (t.ticket_id, t))
                .collect();

            let current: HashSet<CloseKey> = state
                .tickets
                .values()
                .filter_map(|t| t.resolved_at.map(|at| (t.ticket_id, at)))
                .collect();
            state.fired.retain(|key| current.contains(key));
            state.retries.retain(|key, _| current.contains(key));

            tracing::debug!(tracked = state.tickets.len(), "Auto-close tickets updated");
        }
        self.inner.publish();
    }

    /// Change the grace period. Countdowns are recomputed from scratch when
    /// the period actually differs.
    pub fn set_duration_hours(&self, duration_hours: u32) {
        {
            let mut state = self.inner.state();
            let duration = hours(duration_hours);
            if state.duration == duration {
                return;
            }
            state.duration = duration;
        }
        tracing::info!(hours = duration_hours, "Auto-close duration changed");
        self.inner.publish();
    }

    pub fn countdowns(&self) -> Vec<Countdown> {
        self.inner.compute()
    }

    pub fn remaining(&self, ticket_id: TicketId) -> Option<u64> {
        self.countdowns()
            .into_iter()
            .find(|c| c.ticket_id == ticket_id)
            .map(|c| c.remaining_secs)
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Countdown>> {
        self.inner.countdowns.subscribe()
    }

    /// Publish countdowns and request the close of every expired ticket
    /// that has not been requested yet. A failed close is retried on the
    /// reconnect backoff schedule until the policy is exhausted.
    pub async fn tick(&self) -> Vec<(TicketId, SyncResult<AutoCloseOutcome>)> {
        let countdowns = self.inner.publish();
        let now = self.inner.clock.now();

        let due: Vec<CloseKey> = {
            let mut state = self.inner.state();
            let mut due = Vec::new();
            for countdown in countdowns.iter().filter(|c| c.remaining_secs == 0) {
                let key = (countdown.ticket_id, countdown.resolved_at);
                let backing_off = state
                    .retries
                    .get(&key)
                    .is_some_and(|retry| retry.retry_at > now);
                if !backing_off && state.fired.insert(key) {
                    due.push(key);
                }
            }
            due
        };

        let results = join_all(due.into_iter().map(|(ticket_id, resolved_at)| async move {
            (ticket_id, self.inner.auto_close(ticket_id, resolved_at).await)
        }))
        .await;

        if !results.is_empty() {
            self.inner.publish();
        }
        results
    }

    /// Tick once per second until stopped
    pub fn start(&self) {
        let mut runner = self.inner.runner();
        if runner.is_some() {
            return;
        }

        let scheduler = self.clone();
        *runner = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                scheduler.tick().await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(runner) = self.inner.runner().take() {
            runner.abort();
        }
    }

    /// Merge a pushed ticket change into the tracked set
    pub fn apply_remote(&self, change: RecordChange) {
        let lifecycle = match change.kind {
            ChangeKind::Delete => match change.decode_old::<TicketLifecycle>() {
                Some(Ok(old)) => {
                    self.inner.state().tickets.remove(&old.ticket_id);
                    self.inner.publish();
                    return;
                }
                _ => return,
            },
            _ => match change.decode::<TicketLifecycle>() {
                Ok(lifecycle) => lifecycle,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed ticket push");
                    return;
                }
            },
        };

        {
            let mut state = self.inner.state();
            if lifecycle.is_auto_close_eligible() {
                state.tickets.insert(lifecycle.ticket_id, lifecycle);
            } else if state.tickets.remove(&lifecycle.ticket_id).is_some() {
                tracing::debug!(
                    ticket_id = %lifecycle.ticket_id,
                    status = lifecycle.status.as_str(),
                    "Ticket left resolved state"
                );
            }
        }
        self.inner.publish();
    }

    /// Follow ticket status changes
    pub async fn attach(&self, manager: &ConnectionManager, consumer: &str) {
        let scheduler = self.clone();
        let handle = manager
            .subscribe(
                ResourceKey::new(format!("lifecycle:{consumer}")),
                EventFilter::table(tables::TICKETS)
                    .on(ChangeKind::Update)
                    .on(ChangeKind::Delete),
                move |change| scheduler.apply_remote(change),
            )
            .await;
        *self.inner.subscription() = Some(handle);
    }

    pub async fn detach(&self, manager: &ConnectionManager) {
        let handle = self.inner.subscription().take();
        if let Some(handle) = handle {
            manager.unsubscribe(&handle).await;
        }
    }

    /// Stop ticking and forget all countdowns
    pub async fn shutdown(&self, manager: Option<&ConnectionManager>) {
        self.stop();
        if let Some(manager) = manager {
            self.detach(manager).await;
        }
        {
            let mut state = self.inner.state();
            state.tickets.clear();
            state.fired.clear();
            state.retries.clear();
        }
        self.inner.publish();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runner(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.runner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscription(&self) -> MutexGuard<'_, Option<SubscriptionHandle>> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn compute(&self) -> Vec<Countdown> {
        let now = self.clock.now();
        let state = self.state();

        let mut countdowns: Vec<Countdown> = state
            .tickets
            .values()
            .filter_map(|ticket| {
                let resolved_at = ticket.resolved_at?;
                // Unrepresentable deadlines never close
                let closes_at = deadline(resolved_at, state.duration)?;
                Some(Countdown {
                    ticket_id: ticket.ticket_id,
                    resolved_at,
                    closes_at,
                    remaining_secs: seconds_until(closes_at, now),
                })
            })
            .collect();
        countdowns.sort_by(|a, b| {
            a.closes_at
                .cmp(&b.closes_at)
                .then(a.ticket_id.cmp(&b.ticket_id))
        });
        countdowns
    }

    fn publish(&self) -> Vec<Countdown> {
        let countdowns = self.compute();
        self.countdowns.send_replace(countdowns.clone());
        countdowns
    }

    async fn auto_close(
        &self,
        ticket_id: TicketId,
        resolved_at: OffsetDateTime,
    ) -> SyncResult<AutoCloseOutcome> {
        let key = (ticket_id, resolved_at);
        match self.try_close(ticket_id, resolved_at).await {
            Ok(lifecycle) => {
                self.forget(key);
                Ok(AutoCloseOutcome::Closed(lifecycle))
            }
            Err(SyncError::StaleState(reason)) => {
                tracing::debug!(ticket_id = %ticket_id, reason = %reason, "Auto-close skipped");
                self.forget(key);
                Ok(AutoCloseOutcome::AlreadyChanged)
            }
            Err(e) => {
                self.record_failure(key, &e);
                Err(e)
            }
        }
    }

    fn forget(&self, key: CloseKey) {
        let mut state = self.state();
        state.tickets.remove(&key.0);
        state.retries.remove(&key);
    }

    /// Schedule the next attempt, or give up and leave the close marked as
    /// requested so this resolution is not tried again
    fn record_failure(&self, key: CloseKey, error: &SyncError) {
        let now = self.clock.now();
        let mut state = self.state();
        let retry = state.retries.entry(key).or_insert(CloseRetry {
            failures: 0,
            retry_at: now,
        });
        retry.failures += 1;
        let failures = retry.failures;

        if self.retry.is_exhausted(failures) {
            tracing::error!(
                ticket_id = %key.0,
                failures,
                error = %error,
                "Auto-close attempts exhausted"
            );
            return;
        }

        let delay = self.retry.delay_for(failures - 1);
        retry.retry_at = deadline(now, delay).unwrap_or(now);
        state.fired.remove(&key);
        tracing::warn!(
            ticket_id = %key.0,
            failures,
            retry_in = ?delay,
            error = %error,
            "Auto-close failed"
        );
    }

    async fn try_close(
        &self,
        ticket_id: TicketId,
        resolved_at: OffsetDateTime,
    ) -> SyncResult<TicketLifecycle> {
        // Re-read the authoritative state before acting
        let current = self.tickets.fetch_lifecycle(ticket_id).await?;
        match &current {
            Some(lifecycle)
                if lifecycle.is_auto_close_eligible()
                    && lifecycle.resolved_at == Some(resolved_at) => {}
            Some(lifecycle) => {
                return Err(SyncError::StaleState(format!(
                    "ticket is {}",
                    lifecycle.status.as_str()
                )))
            }
            None => return Err(SyncError::StaleState("ticket not found".to_string())),
        }

        let now = self.clock.now();
        let lifecycle = match self.tickets.close_if_resolved(ticket_id, now).await? {
            CloseOutcome::Closed(lifecycle) => lifecycle,
            CloseOutcome::NotEligible { current } => {
                let status = current
                    .map(|c| c.status.as_str())
                    .unwrap_or("missing");
                return Err(SyncError::StaleState(format!("ticket is {status}")));
            }
        };

        let hours = self.state().duration.as_secs() / 3600;
        tracing::info!(ticket_id = %ticket_id, hours, "Ticket auto-closed");

        let activity = NewActivity {
            ticket_id,
            activity_type: "closed".to_string(),
            // System action
            actor_id: None,
            description: format!("Ticket automatically closed after {hours} hours"),
        };
        if let Err(e) = self.activity.record_activity(&activity).await {
            tracing::warn!(ticket_id = %ticket_id, error = %e, "Failed to record close activity");
        }

        Ok(lifecycle)
    }
}

fn hours(count: u32) -> Duration {
    Duration::from_secs(u64::from(count) * 3600)
}
