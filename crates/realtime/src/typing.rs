//! Typing presence
//!
//! Tracks who is typing in one conversation. Facts expire after a fixed TTL
//! even if the authoritative delete never arrives, and remote updates are
//! applied last-writer-wins by their `updated_at` timestamp.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use helpdesk_shared::{AuthorRole, ConversationId, LocalUser, TypingFact, TypingStore, UserId};

use crate::clock::{Clock, SystemClock};
use crate::realtime::{
    tables, ChangeKind, ConnectionManager, EventFilter, RecordChange, ResourceKey,
    SubscriptionHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSettings {
    /// Facts not refreshed for this long are not rendered
    pub ttl: Duration,
    /// How often expired facts are purged
    pub sweep_interval: Duration,
    /// Minimum spacing of repeated "still typing" writes
    pub throttle: Duration,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            throttle: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
struct LocalTyping {
    typing: bool,
    last_write: Option<OffsetDateTime>,
}

/// Old record of a deleted typing row
#[derive(Deserialize)]
struct DeletedFact {
    conversation_id: Option<ConversationId>,
    user_id: UserId,
    #[serde(default)]
    user_name: String,
    #[serde(default)]
    role: Option<AuthorRole>,
}

struct Inner {
    conversation_id: ConversationId,
    user: LocalUser,
    store: Arc<dyn TypingStore>,
    clock: Arc<dyn Clock>,
    settings: TypingSettings,
    /// Latest known fact per remote user, including stop tombstones
    facts: Mutex<HashMap<UserId, TypingFact>>,
    local: Mutex<LocalTyping>,
    published: watch::Sender<Vec<TypingFact>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<Inner>,
}

impl TypingTracker {
    pub fn new(
        conversation_id: ConversationId,
        user: LocalUser,
        store: Arc<dyn TypingStore>,
        settings: TypingSettings,
    ) -> Self {
        Self::with_clock(conversation_id, user, store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        conversation_id: ConversationId,
        user: LocalUser,
        store: Arc<dyn TypingStore>,
        settings: TypingSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                conversation_id,
                user,
                store,
                clock,
                settings,
                facts: Mutex::new(HashMap::new()),
                local: Mutex::new(LocalTyping::default()),
                published,
                sweep: Mutex::new(None),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Report local keystroke activity.
    ///
    /// Repeated `true` calls inside the throttle interval skip the write;
    /// failures are logged and never surfaced.
    pub async fn set_typing(&self, is_typing: bool) {
        let inner = &self.inner;
        let now = inner.clock.now();

        let write = {
            let mut local = inner.local();
            let write = match (local.typing, is_typing) {
                (false, true) => true,
                (true, true) => local
                    .last_write
                    .map(|at| now - at >= inner.settings.throttle)
                    .unwrap_or(true),
                (was_typing, false) => was_typing,
            };
            local.typing = is_typing;
            if write {
                local.last_write = Some(now);
            }
            write
        };

        if !write {
            return;
        }

        let result = if is_typing {
            let fact = TypingFact {
                conversation_id: inner.conversation_id,
                user_id: inner.user.id,
                user_name: inner.user.name.clone(),
                role: inner.user.role,
                is_typing: true,
                updated_at: now,
            };
            inner.store.upsert_typing(&fact).await
        } else {
            inner
                .store
                .clear_typing(inner.conversation_id, inner.user.id)
                .await
        };

        if let Err(e) = result {
            tracing::warn!(
                conversation_id = %inner.conversation_id,
                is_typing,
                error = %e,
                "Failed to write typing state"
            );
        }
    }

    pub fn is_local_typing(&self) -> bool {
        self.inner.local().typing
    }

    /// Merge a pushed typing change
    pub fn apply_remote(&self, change: RecordChange) {
        let inner = &self.inner;

        let incoming = match change.kind {
            ChangeKind::Insert | ChangeKind::Update => match change.decode::<TypingFact>() {
                Ok(fact) => fact,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed typing push");
                    return;
                }
            },
            ChangeKind::Delete => match change.decode_old::<DeletedFact>() {
                Some(Ok(deleted)) => {
                    if deleted
                        .conversation_id
                        .is_some_and(|id| id != inner.conversation_id)
                        || deleted.user_id == inner.user.id
                    {
                        return;
                    }
                    inner.tombstone(deleted);
                    return;
                }
                _ => {
                    tracing::debug!("Typing delete without usable old record");
                    return;
                }
            },
        };

        if incoming.conversation_id != inner.conversation_id || incoming.user_id == inner.user.id {
            return;
        }

        let changed = {
            let mut facts = inner.facts();
            match facts.get(&incoming.user_id) {
                Some(existing) if existing.updated_at > incoming.updated_at => {
                    tracing::debug!(
                        user_id = %incoming.user_id,
                        "Ignoring stale typing push"
                    );
                    false
                }
                _ => {
                    facts.insert(incoming.user_id, incoming);
                    true
                }
            }
        };

        if changed {
            inner.publish();
        }
    }

    /// Remote users currently typing; the local user is never included
    pub fn current_facts(&self) -> Vec<TypingFact> {
        self.inner.active_facts()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<TypingFact>> {
        self.inner.published.subscribe()
    }

    /// Start the periodic purge of expired facts
    pub fn start_sweep(&self) {
        let mut sweep = self.inner.sweep();
        if sweep.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.sweep_interval;
        *sweep = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.purge_expired(),
                    None => break,
                }
            }
        }));
    }

    pub async fn attach(&self, manager: &ConnectionManager) {
        let conversation_id = self.inner.conversation_id;
        let tracker = self.clone();

        let handle = manager
            .subscribe(
                ResourceKey::conversation_typing(conversation_id),
                EventFilter::table(tables::TYPING).eq("conversation_id", conversation_id),
                move |change| tracker.apply_remote(change),
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

    /// Stop sweeping and send a best-effort stop-typing signal
    pub async fn close(&self) {
        if let Some(sweep) = self.inner.sweep().take() {
            sweep.abort();
        }

        self.set_typing(false).await;
        self.inner.facts().clear();
        self.inner.publish();

        tracing::debug!(conversation_id = %self.inner.conversation_id, "Typing tracker closed");
    }
}

impl Inner {
    fn facts(&self) -> MutexGuard<'_, HashMap<UserId, TypingFact>> {
        self.facts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local(&self) -> MutexGuard<'_, LocalTyping> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweep.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscription(&self) -> MutexGuard<'_, Option<SubscriptionHandle>> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, fact: &TypingFact, now: OffsetDateTime) -> bool {
        fact.is_typing && now - fact.updated_at < self.settings.ttl
    }

    fn active_facts(&self) -> Vec<TypingFact> {
        let now = self.clock.now();
        let mut active: Vec<TypingFact> = self
            .facts()
            .values()
            .filter(|fact| self.is_live(fact, now))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.user_name.cmp(&b.user_name).then(a.user_id.cmp(&b.user_id)));
        active
    }

    fn publish(&self) {
        let active = self.active_facts();
        self.published.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
    }

    /// Record a stop that wins over any older pushed fact
    /// Record a stop for the user even when nothing is known about them yet,
    /// so older "typing" pushes that arrive afterwards lose
    fn tombstone(&self, deleted: DeletedFact) {
        let now = self.clock.now();
        {
            let mut facts = self.facts();
            let fact = facts.entry(deleted.user_id).or_insert_with(|| TypingFact {
                conversation_id: self.conversation_id,
                user_id: deleted.user_id,
                user_name: deleted.user_name,
                role: deleted.role.unwrap_or(AuthorRole::EndUser),
                is_typing: false,
                updated_at: now,
            });
            fact.is_typing = false;
            fact.updated_at = fact.updated_at.max(now);
        }
        self.publish();
    }

    fn purge_expired(&self) {
        let now = self.clock.now();
        let ttl = self.settings.ttl;
        let removed = {
            let mut facts = self.facts();
            let before = facts.len();
            facts.retain(|_, fact| now - fact.updated_at < ttl);
            before - facts.len()
        };

        if removed > 0 {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                removed,
                "Purged expired typing facts"
            );
        }
        self.publish();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use helpdesk_shared::{AuthorRole, InMemoryStore};
    use time::macros::datetime;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        tracker: TypingTracker,
        conversation_id: ConversationId,
        local: LocalUser,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 10:00:00 UTC)));
        let conversation_id = ConversationId::new();
        let local = LocalUser::new(UserId::new(), "Dana", AuthorRole::Agent);
        let tracker = TypingTracker::with_clock(
            conversation_id,
            local.clone(),
            store.clone(),
            TypingSettings::default(),
            clock.clone(),
        );
        Fixture {
            store,
            clock,
            tracker,
            conversation_id,
            local,
        }
    }

    fn push(
        f: &Fixture,
        user_id: UserId,
        is_typing: bool,
        updated_at: OffsetDateTime,
    ) -> RecordChange {
        let fact = TypingFact {
            conversation_id: f.conversation_id,
            user_id,
            user_name: "Sam".to_string(),
            role: AuthorRole::EndUser,
            is_typing,
            updated_at,
        };
        RecordChange::update(tables::TYPING, serde_json::to_value(fact).unwrap())
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let f = fixture();
        let sam = UserId::new();
        let t0 = f.clock.now();

        f.tracker.apply_remote(push(&f, sam, true, t0));
        assert_eq!(f.tracker.current_facts().len(), 1);

        f.tracker
            .apply_remote(push(&f, sam, false, t0 + Duration::from_millis(1_500)));
        assert!(f.tracker.current_facts().is_empty());

        // A reordered older push cannot resurrect presence
        f.tracker.apply_remote(push(&f, sam, true, t0));
        assert!(f.tracker.current_facts().is_empty());

        // Nor can one that trails a delete for a user never seen before
        let alex = UserId::new();
        f.tracker.apply_remote(RecordChange::delete(
            tables::TYPING,
            serde_json::json!({ "conversation_id": f.conversation_id, "user_id": alex }),
        ));
        f.tracker
            .apply_remote(push(&f, alex, true, t0 - Duration::from_secs(1)));
        assert!(f.tracker.current_facts().is_empty());
    }

    #[tokio::test]
    async fn test_expired_facts_are_hidden() {
        let f = fixture();
        let sam = UserId::new();
        f.tracker.apply_remote(push(&f, sam, true, f.clock.now()));

        f.clock.advance(Duration::from_secs(29));
        assert_eq!(f.tracker.current_facts().len(), 1);

        f.clock.advance(Duration::from_secs(1));
        assert!(f.tracker.current_facts().is_empty());
    }

    #[tokio::test]
    async fn test_local_user_excluded() {
        let f = fixture();
        f.tracker
            .apply_remote(push(&f, f.local.id, true, f.clock.now()));
        assert!(f.tracker.current_facts().is_empty());
    }

    #[tokio::test]
    async fn test_throttled_writes() {
        let f = fixture();
        let t0 = f.clock.now();

        f.tracker.set_typing(true).await;
        let first = f.store.typing_fact(f.conversation_id, f.local.id).unwrap();
        assert_eq!(first.updated_at, t0);

        f.clock.advance(Duration::from_millis(500));
        f.tracker.set_typing(true).await;
        let fact = f.store.typing_fact(f.conversation_id, f.local.id).unwrap();
        assert_eq!(fact.updated_at, t0);

        f.clock.advance(Duration::from_millis(1_500));
        f.tracker.set_typing(true).await;
        let fact = f.store.typing_fact(f.conversation_id, f.local.id).unwrap();
        assert_eq!(fact.updated_at, t0 + Duration::from_secs(2));

        f.tracker.set_typing(false).await;
        assert!(f.store.typing_fact(f.conversation_id, f.local.id).is_none());
        assert!(!f.tracker.is_local_typing());
    }

    #[tokio::test]
    async fn test_delete_tombstones_user() {
        let f = fixture();
        let sam = UserId::new();
        f.tracker.apply_remote(push(&f, sam, true, f.clock.now()));

        f.tracker.apply_remote(RecordChange::delete(
            tables::TYPING,
            serde_json::json!({ "conversation_id": f.conversation_id, "user_id": sam }),
        ));
        assert!(f.tracker.current_facts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_publishes_expiry() {
        let f = fixture();
        let sam = UserId::new();
        let mut watch = f.tracker.watch();
        f.tracker.start_sweep();

        f.tracker.apply_remote(push(&f, sam, true, f.clock.now()));
        assert_eq!(watch.borrow_and_update().len(), 1);

        f.clock.advance(Duration::from_secs(31));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(watch.borrow_and_update().is_empty());
        f.tracker.close().await;
    }

    #[tokio::test]
    async fn test_close_sends_stop_signal() {
        let f = fixture();
        f.tracker.set_typing(true).await;
        assert!(f.store.typing_fact(f.conversation_id, f.local.id).is_some());

        f.tracker.close().await;
        assert!(f.store.typing_fact(f.conversation_id, f.local.id).is_none());
    }
}
