//! Time-windowed activity deduplication
//!
//! Server-side triggers can fire more than once for a single ticket
//! operation. Events sharing `(type, actor, discriminator)` that land within
//! the window are collapsed to the first one seen.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use helpdesk_shared::UserId;

use super::kind::{ActivityEvent, ActivityKind};

/// How the window is placed on the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowMode {
    /// A window opens at each kept event; later events with the same key
    /// are dropped until the window has elapsed.
    #[default]
    Sliding,
    /// Fixed buckets aligned to multiples of the window length
    FixedBucket,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Discriminator {
    None,
    /// Free-text content that distinguishes otherwise identical events
    Content(String),
    /// Never collapsed
    Unique(Uuid, Option<OffsetDateTime>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    tag: String,
    actor: Option<UserId>,
    discriminator: Discriminator,
}

impl DedupKey {
    fn for_event(event: &ActivityEvent) -> Self {
        let discriminator = match &event.kind {
            ActivityKind::StatusChanged { .. } | ActivityKind::Referred { .. } => {
                Discriminator::Content(event.description.clone())
            }
            ActivityKind::DetailsUpdated => Discriminator::Unique(event.id, event.created_at),
            _ => Discriminator::None,
        };

        Self {
            tag: event.kind.tag().to_string(),
            actor: event.actor_id,
            discriminator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deduplicator {
    window: Duration,
    mode: WindowMode,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(Duration::from_millis(5_000))
    }
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            mode: WindowMode::Sliding,
        }
    }

    pub fn with_mode(mut self, mode: WindowMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Collapse duplicates, returning the survivors in timestamp order.
    ///
    /// Deterministic for a given input set regardless of input order.
    /// Events without a timestamp are never collapsed and sort last.
    pub fn dedupe(&self, events: &[ActivityEvent]) -> Vec<ActivityEvent> {
        let mut sorted: Vec<&ActivityEvent> = events.iter().collect();
        sorted.sort_by(|a, b| {
            timeline_order(a.created_at, b.created_at).then_with(|| a.id.cmp(&b.id))
        });

        let window_ms = i128::try_from(self.window.as_millis()).unwrap_or(i128::MAX).max(1);
        let mut anchors: HashMap<DedupKey, i128> = HashMap::new();
        let mut buckets: HashSet<(DedupKey, i128)> = HashSet::new();
        let mut kept = Vec::with_capacity(sorted.len());

        for event in sorted {
            let Some(created_at) = event.created_at else {
                kept.push(event.clone());
                continue;
            };

            let key = DedupKey::for_event(event);
            if matches!(key.discriminator, Discriminator::Unique(..)) {
                kept.push(event.clone());
                continue;
            }

            let ts = unix_millis(created_at);
            let duplicate = match self.mode {
                WindowMode::Sliding => match anchors.get(&key) {
                    Some(anchor) if ts - anchor < window_ms => true,
                    _ => {
                        anchors.insert(key, ts);
                        false
                    }
                },
                WindowMode::FixedBucket => {
                    let bucket = ts.div_euclid(window_ms) * window_ms;
                    !buckets.insert((key, bucket))
                }
            };

            if duplicate {
                tracing::trace!(
                    activity_id = %event.id,
                    activity_type = event.kind.tag(),
                    "Dropped duplicate activity"
                );
            } else {
                kept.push(event.clone());
            }
        }

        kept
    }
}

fn unix_millis(at: OffsetDateTime) -> i128 {
    at.unix_timestamp_nanos() / 1_000_000
}

/// Ascending, with missing timestamps last
fn timeline_order(a: Option<OffsetDateTime>, b: Option<OffsetDateTime>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helpdesk_shared::TicketId;
    use time::macros::datetime;

    fn event(tag: &str, actor: UserId, description: &str, offset_ms: i64) -> ActivityEvent {
        let base = datetime!(2025-03-01 10:00:00 UTC);
        ActivityEvent {
            id: Uuid::new_v4(),
            ticket_id: TicketId::new(),
            kind: ActivityKind::parse(tag, description),
            actor_id: Some(actor),
            description: description.to_string(),
            created_at: Some(base + time::Duration::milliseconds(offset_ms)),
        }
    }

    #[test]
    fn test_generic_duplicates_collapse() {
        let admin = UserId::new();
        let events = vec![
            event("assigned", admin, "Assigned to Dana", 0),
            event("assigned", admin, "Assigned to Dana", 1_200),
            event("assigned", admin, "Assigned to Dana", 4_900),
        ];

        let kept = Deduplicator::default().dedupe(&events);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, events[0].id);
    }

    #[test]
    fn test_distinct_actors_are_kept() {
        let events = vec![
            event("assigned", UserId::new(), "", 0),
            event("assigned", UserId::new(), "", 100),
        ];
        assert_eq!(Deduplicator::default().dedupe(&events).len(), 2);
    }

    #[test]
    fn test_status_changes_use_content() {
        let admin = UserId::new();
        let events = vec![
            event("status_changed", admin, "Open → In progress", 0),
            event("status_changed", admin, "Priority: High", 1_000),
            event("status_changed", admin, "Category: Billing", 3_000),
            event("status_changed", admin, "Open → In progress", 2_000),
        ];

        let kept = Deduplicator::default().dedupe(&events);
        let descriptions: Vec<&str> = kept.iter().map(|e| e.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec!["Open → In progress", "Priority: High", "Category: Billing"]
        );
    }

    #[test]
    fn test_details_updates_always_survive() {
        let admin = UserId::new();
        let events = vec![
            event("details_updated", admin, "Subject changed", 0),
            event("details_updated", admin, "Subject changed", 0),
            event("details_updated", admin, "Subject changed", 500),
        ];
        assert_eq!(Deduplicator::default().dedupe(&events).len(), 3);
    }

    #[test]
    fn test_missing_timestamp_fails_open() {
        let admin = UserId::new();
        let mut undated = event("assigned", admin, "", 0);
        undated.created_at = None;
        let events = vec![event("assigned", admin, "", 0), undated.clone(), undated];

        let kept = Deduplicator::default().dedupe(&events);
        assert_eq!(kept.len(), 3);
        assert!(kept[0].created_at.is_some());
        assert!(kept[2].created_at.is_none());
    }

    #[test]
    fn test_sliding_window_reopens_after_elapsed() {
        let admin = UserId::new();
        let events = vec![
            event("escalated", admin, "", 0),
            event("escalated", admin, "", 3_000),
            event("escalated", admin, "", 5_000),
            event("escalated", admin, "", 7_000),
        ];

        let kept = Deduplicator::default().dedupe(&events);
        let offsets: Vec<i128> = kept
            .iter()
            .filter_map(|e| e.created_at)
            .map(|t| unix_millis(t) - unix_millis(datetime!(2025-03-01 10:00:00 UTC)))
            .collect();
        assert_eq!(offsets, vec![0, 5_000]);
    }

    #[test]
    fn test_fixed_bucket_splits_at_boundary() {
        let admin = UserId::new();
        // 10:00:04.900 and 10:00:05.100 fall in different buckets
        let events = vec![
            event("assigned", admin, "", 4_900),
            event("assigned", admin, "", 5_100),
            event("assigned", admin, "", 9_000),
        ];

        let fixed = Deduplicator::default().with_mode(WindowMode::FixedBucket);
        assert_eq!(fixed.dedupe(&events).len(), 2);
        assert_eq!(Deduplicator::default().dedupe(&events).len(), 1);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let admin = UserId::new();
        let events = vec![
            event("resolved", admin, "", 2_000),
            event("resolved", admin, "", 0),
            event("closed", admin, "", 1_000),
        ];
        let mut reversed = events.clone();
        reversed.reverse();

        let dedup = Deduplicator::default();
        assert_eq!(dedup.dedupe(&events), dedup.dedupe(&reversed));
        assert_eq!(dedup.dedupe(&events)[0].id, events[1].id);
    }
}
