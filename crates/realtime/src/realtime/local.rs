//! In-process push transport
//!
//! Fans changes published on the hub out to every open stream whose filter
//! matches, the way the backing store's push channel does. Pairs with
//! `InMemoryStore` for local development, and can simulate drops, failed
//! opens and opens that never complete.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::events::{EventFilter, PushFrame, PushStream, PushTransport, RecordChange, ResourceKey};
use crate::error::TransportError;

struct Subscriber {
    key: ResourceKey,
    filter: EventFilter,
    sender: mpsc::UnboundedSender<Result<PushFrame, TransportError>>,
}

#[derive(Default)]
struct HubState {
    subscribers: Vec<Subscriber>,
    failing_opens: usize,
    stalled_opens: usize,
    opens: Vec<(ResourceKey, Instant)>,
}

#[derive(Clone, Default)]
pub struct LocalPushHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalPushHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a change to every matching stream. Returns the recipient count.
    pub fn publish(&self, change: RecordChange) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.sender.is_closed());

        let mut delivered = 0;
        for subscriber in state.subscribers.iter() {
            if subscriber.filter.matches(&change)
                && subscriber
                    .sender
                    .send(Ok(PushFrame::Change(change.clone())))
                    .is_ok()
            {
                delivered += 1;
            }
        }

        tracing::debug!(
            table = %change.table,
            kind = ?change.kind,
            recipients = delivered,
            "Published change"
        );
        delivered
    }

    pub fn heartbeat(&self) {
        let state = self.state();
        for subscriber in state.subscribers.iter() {
            let _ = subscriber.sender.send(Ok(PushFrame::Heartbeat));
        }
    }

    /// Fail every open stream, as a dropped session would
    pub fn disconnect_all(&self) {
        let mut state = self.state();
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.sender.send(Err(TransportError::Closed));
        }
    }

    /// Fail only the streams opened for `key`
    pub fn disconnect(&self, key: &ResourceKey) {
        let mut state = self.state();
        state.subscribers.retain(|subscriber| {
            if &subscriber.key == key {
                let _ = subscriber.sender.send(Err(TransportError::Closed));
                false
            } else {
                true
            }
        });
    }

    /// Reject the next `count` open requests
    pub fn fail_next_opens(&self, count: usize) {
        self.state().failing_opens = count;
    }

    /// Leave the next `count` open requests pending forever
    pub fn stall_next_opens(&self, count: usize) {
        self.state().stalled_opens = count;
    }

    /// Instants at which `key` was opened, successful or not
    pub fn open_times(&self, key: &ResourceKey) -> Vec<Instant> {
        self.state()
            .opens
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.state().opens.len()
    }

    /// Number of streams for `key` whose receiver is still alive
    pub fn live_streams(&self, key: &ResourceKey) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|s| &s.key == key && !s.sender.is_closed())
            .count()
    }
}

#[async_trait]
impl PushTransport for LocalPushHub {
    async fn open(
        &self,
        key: &ResourceKey,
        filter: &EventFilter,
    ) -> Result<PushStream, TransportError> {
        let stalled = {
            let mut state = self.state();
            state.opens.push((key.clone(), Instant::now()));
            if state.stalled_opens > 0 {
                state.stalled_opens -= 1;
                true
            } else {
                false
            }
        };
        if stalled {
            return std::future::pending().await;
        }

        let mut state = self.state();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::Rejected("simulated open failure".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            key: key.clone(),
            filter: filter.clone(),
            sender,
        });

        Ok(receiver)
    }
}
