//! Per-agent attention counts
//!
//! Combines open tickets in covered departments, unread messages, pending
//! referrals and pending escalations into one badge model. Escalations are
//! tracked but do not contribute to `total`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_retry::Retry;
use uuid::Uuid;

use helpdesk_shared::{
    ConversationId, DepartmentId, Message, MessageId, ReadMarkerStore, TicketId, UserId,
};

use crate::backoff::ReconnectPolicy;
use crate::clock::{Clock, SystemClock};
use crate::error::SyncResult;
use crate::realtime::{
    tables, ChangeKind, ConnectionManager, EventFilter, RecordChange, ResourceKey,
    SubscriptionHandle,
};

/// Snapshot of everything demanding an agent's attention
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttentionSummary {
    /// `new_tickets + unread_messages + referrals`
    pub total: u32,
    pub new_tickets: u32,
    pub unread_messages: u32,
    pub referrals: u32,
    /// Kept as a separate signal, never part of `total`
    pub escalations: u32,
    pub unread_by_ticket: BTreeMap<TicketId, u32>,
    pub open_by_department: BTreeMap<DepartmentId, u32>,
}

#[derive(Default)]
struct InboxState {
    covered: HashSet<DepartmentId>,
    open_tickets: HashMap<DepartmentId, u32>,
    conversations: HashMap<ConversationId, TicketId>,
    read_markers: HashMap<TicketId, OffsetDateTime>,
    /// Unread message ids per ticket, so redelivered pushes count once
    unread: HashMap<TicketId, HashMap<Uuid, OffsetDateTime>>,
    referrals: HashSet<Uuid>,
    escalations: HashSet<Uuid>,
}

impl InboxState {
    fn summary(&self) -> AttentionSummary {
        let open_by_department: BTreeMap<DepartmentId, u32> = self
            .open_tickets
            .iter()
            .filter(|(department, _)| self.covered.contains(department))
            .map(|(department, count)| (*department, *count))
            .collect();

        let unread_by_ticket: BTreeMap<TicketId, u32> = self
            .unread
            .iter()
            .filter(|(_, messages)| !messages.is_empty())
            .map(|(ticket, messages)| (*ticket, count(messages.len())))
            .collect();

        let new_tickets = saturating_sum(open_by_department.values());
        let unread_messages = saturating_sum(unread_by_ticket.values());
        let referrals = count(self.referrals.len());

        AttentionSummary {
            total: new_tickets
                .saturating_add(unread_messages)
                .saturating_add(referrals),
            new_tickets,
            unread_messages,
            referrals,
            escalations: count(self.escalations.len()),
            unread_by_ticket,
            open_by_department,
        }
    }

    fn is_unread(&self, ticket_id: TicketId, created_at: OffsetDateTime) -> bool {
        self.read_markers
            .get(&ticket_id)
            .map_or(true, |read_at| created_at > *read_at)
    }
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn saturating_sum<'a>(values: impl Iterator<Item = &'a u32>) -> u32 {
    values.fold(0, |total, n| total.saturating_add(*n))
}

struct Inner {
    agent_id: UserId,
    markers: Arc<dyn ReadMarkerStore>,
    retry: ReconnectPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<InboxState>,
    summary: watch::Sender<AttentionSummary>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self) {
        let summary = self.state().summary();
        self.summary.send_replace(summary);
    }
}

#[derive(Clone)]
pub struct NotificationAggregator {
    inner: Arc<Inner>,
}

impl NotificationAggregator {
    /// `retry` governs read-marker writes; pass the connection policy so
    /// both back off the same way.
    pub fn new(
        agent_id: UserId,
        markers: Arc<dyn ReadMarkerStore>,
        retry: ReconnectPolicy,
    ) -> Self {
        Self::with_clock(agent_id, markers, retry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        agent_id: UserId,
        markers: Arc<dyn ReadMarkerStore>,
        retry: ReconnectPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (summary, _) = watch::channel(AttentionSummary::default());
        Self {
            inner: Arc::new(Inner {
                agent_id,
                markers,
                retry,
                clock,
                state: Mutex::new(InboxState::default()),
                summary,
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Load the agent's stored read markers. Later markers win over earlier
    /// local ones.
    pub async fn hydrate(&self) -> SyncResult<usize> {
        let markers = self.inner.markers.read_markers(self.inner.agent_id).await?;
        let loaded = markers.len();
        {
            let mut state = self.inner.state();
            for (ticket_id, read_at) in markers {
                let marker = state.read_markers.entry(ticket_id).or_insert(read_at);
                if read_at > *marker {
                    *marker = read_at;
                }
                let marker = *marker;
                if let Some(unread) = state.unread.get_mut(&ticket_id) {
                    unread.retain(|_, created_at| *created_at > marker);
                }
            }
        }
        tracing::debug!(agent_id = %self.inner.agent_id, markers = loaded, "Read markers loaded");
        self.inner.publish();
        Ok(loaded)
    }

    pub fn cover_departments(&self, departments: impl IntoIterator<Item = DepartmentId>) {
        self.inner.state().covered = departments.into_iter().collect();
        self.inner.publish();
    }

    pub fn set_open_tickets(&self, department: DepartmentId, open: u32) {
        self.inner.state().open_tickets.insert(department, open);
        self.inner.publish();
    }

    /// Register which ticket a conversation belongs to. Messages in unknown
    /// conversations are not counted.
    pub fn track_conversation(&self, conversation_id: ConversationId, ticket_id: TicketId) {
        self.inner
            .state()
            .conversations
            .insert(conversation_id, ticket_id);
    }

    /// Count a message as unread if it is newer than the ticket's marker and
    /// was written by someone else.
    pub fn record_message(&self, message: &Message) -> bool {
        if message.author_id == self.inner.agent_id {
            return false;
        }
        let MessageId::Server(id) = message.id else {
            return false;
        };

        let counted = {
            let mut state = self.inner.state();
            let Some(ticket_id) = state.conversations.get(&message.conversation_id).copied() else {
                return false;
            };
            if !state.is_unread(ticket_id, message.created_at) {
                return false;
            }
            state
                .unread
                .entry(ticket_id)
                .or_default()
                .insert(id, message.created_at)
                .is_none()
        };

        if counted {
            self.inner.publish();
        }
        counted
    }

    pub fn set_referrals(&self, pending: impl IntoIterator<Item = Uuid>) {
        self.inner.state().referrals = pending.into_iter().collect();
        self.inner.publish();
    }

    pub fn add_referral(&self, referral_id: Uuid) {
        if self.inner.state().referrals.insert(referral_id) {
            self.inner.publish();
        }
    }

    pub fn resolve_referral(&self, referral_id: Uuid) {
        if self.inner.state().referrals.remove(&referral_id) {
            self.inner.publish();
        }
    }

    pub fn set_escalations(&self, pending: impl IntoIterator<Item = Uuid>) {
        self.inner.state().escalations = pending.into_iter().collect();
        self.inner.publish();
    }

    pub fn add_escalation(&self, escalation_id: Uuid) {
        if self.inner.state().escalations.insert(escalation_id) {
            self.inner.publish();
        }
    }

    pub fn resolve_escalation(&self, escalation_id: Uuid) {
        if self.inner.state().escalations.remove(&escalation_id) {
            self.inner.publish();
        }
    }

    /// Clear the ticket's unread messages now and persist the marker in the
    /// background, retrying with the configured backoff.
    pub fn mark_read(&self, ticket_id: TicketId) -> JoinHandle<SyncResult<()>> {
        let read_at = self.inner.clock.now();
        {
            let mut state = self.inner.state();
            state.read_markers.insert(ticket_id, read_at);
            state.unread.remove(&ticket_id);
        }
        self.inner.publish();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let agent_id = inner.agent_id;
            let markers = inner.markers.clone();
            let result = Retry::spawn(inner.retry.delays(), || {
                let markers = markers.clone();
                async move {
                    let result = markers.write_read_marker(agent_id, ticket_id, read_at).await;
                    if let Err(e) = &result {
                        tracing::warn!(
                            ticket_id = %ticket_id,
                            error = %e,
                            "Read marker write failed, retrying"
                        );
                    }
                    result
                }
            })
            .await;

            match result {
                Ok(()) => {
                    tracing::debug!(ticket_id = %ticket_id, "Read marker stored");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(ticket_id = %ticket_id, error = %e, "Giving up on read marker");
                    Err(e.into())
                }
            }
        })
    }

    /// Apply a pushed message insert
    pub fn ingest(&self, change: RecordChange) {
        if change.kind != ChangeKind::Insert || change.table != tables::MESSAGES {
            return;
        }
        match change.decode::<Message>() {
            Ok(message) => {
                self.record_message(&message);
            }
            Err(e) => tracing::warn!(error = %e, "Malformed message push"),
        }
    }

    pub async fn attach(&self, manager: &ConnectionManager) {
        let aggregator = self.clone();
        let handle = manager
            .subscribe(
                ResourceKey::agent_inbox(self.inner.agent_id, "messages"),
                EventFilter::table(tables::MESSAGES).on(ChangeKind::Insert),
                move |change| aggregator.ingest(change),
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

    pub fn summary(&self) -> AttentionSummary {
        self.inner.state().summary()
    }

    pub fn watch(&self) -> watch::Receiver<AttentionSummary> {
        self.inner.summary.subscribe()
    }

    fn subscription(&self) -> MutexGuard<'_, Option<SubscriptionHandle>> {
        self.inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
