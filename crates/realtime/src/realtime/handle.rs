//! Subscription handle bookkeeping
//!
//! A `ConnectionHandle` is the manager's record of one logical subscription;
//! callers only ever hold the lightweight `SubscriptionHandle`.

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::{EventCallback, EventFilter, ResourceKey};

/// Lifecycle status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleStatus {
    Connecting,
    Subscribed,
    Errored,
    Closed,
}

/// Returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub key: ResourceKey,
}

/// Point-in-time view of a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub id: Uuid,
    pub key: ResourceKey,
    pub status: HandleStatus,
    pub reconnect_attempts: u32,
    pub last_subscribed_at: Option<OffsetDateTime>,
}

pub(crate) struct ConnectionHandle {
    pub id: Uuid,
    pub key: ResourceKey,
    pub filter: EventFilter,
    pub callback: EventCallback,
    pub status: HandleStatus,
    pub reconnect_attempts: u32,
    pub last_subscribed_at: Option<OffsetDateTime>,
    /// Identifies the currently open stream; stale pump reports are ignored
    pub channel_id: u64,
    pump: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn new(key: ResourceKey, filter: EventFilter, callback: EventCallback) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            filter,
            callback,
            status: HandleStatus::Connecting,
            reconnect_attempts: 0,
            last_subscribed_at: None,
            channel_id: 0,
            pump: None,
        }
    }

    pub fn public(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            id: self.id,
            key: self.key.clone(),
        }
    }

    pub fn snapshot(&self) -> HandleSnapshot {
        HandleSnapshot {
            id: self.id,
            key: self.key.clone(),
            status: self.status,
            reconnect_attempts: self.reconnect_attempts,
            last_subscribed_at: self.last_subscribed_at,
        }
    }

    /// Attach the task forwarding the open stream
    pub fn attach_pump(&mut self, pump: JoinHandle<()>) {
        self.stop_pump();
        self.pump = Some(pump);
    }

    pub fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    pub fn close(&mut self) {
        self.stop_pump();
        self.status = HandleStatus::Closed;
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
