//! Connection manager
//!
//! Owns one push subscription per resource key. All subscriptions share one
//! transport session, so when any of them drops the manager reopens every
//! registered handle, retrying with exponential backoff until the policy is
//! exhausted, at which point it reports a degraded connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::events::{
    EventCallback, EventFilter, PushFrame, PushStream, PushTransport, RecordChange, ResourceKey,
};
use super::handle::{ConnectionHandle, HandleSnapshot, HandleStatus, SubscriptionHandle};
use crate::backoff::ReconnectPolicy;
use crate::clock::{Clock, SystemClock};
use crate::error::{Notice, SyncError, TransportError};

/// Health of the shared push session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    /// Nothing subscribed successfully yet
    Connecting,
    Healthy,
    /// A reconnect is scheduled
    Reconnecting { attempt: u32, retry_in: Duration },
    /// Automatic retries stopped; a manual refresh is needed
    Degraded { failures: u32 },
}

impl ConnectionHealth {
    /// Notice to show for this state, if any
    pub fn notice(&self) -> Option<Notice> {
        match self {
            ConnectionHealth::Connecting | ConnectionHealth::Healthy => None,
            ConnectionHealth::Reconnecting { .. } => {
                SyncError::Transport(TransportError::Closed).notice()
            }
            ConnectionHealth::Degraded { failures } => {
                SyncError::Degraded { failures: *failures }.notice()
            }
        }
    }
}

/// Handle counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total: usize,
    pub subscribed: usize,
    pub connecting: usize,
    pub errored: usize,
    /// Consecutive failed reconnect attempts
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct ReconnectState {
    failures: u32,
    degraded: bool,
    pending: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    heartbeat_timeout: Duration,
    clock: Arc<dyn Clock>,
    handles: RwLock<HashMap<ResourceKey, ConnectionHandle>>,
    reconnect: Mutex<ReconnectState>,
    health: watch::Sender<ConnectionHealth>,
    next_channel: AtomicU64,
}

/// Manages push subscriptions for one scope (a session or a view)
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        policy: ReconnectPolicy,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self::with_clock(transport, policy, heartbeat_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn PushTransport>,
        policy: ReconnectPolicy,
        heartbeat_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (health, _) = watch::channel(ConnectionHealth::Connecting);

        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                heartbeat_timeout,
                clock,
                handles: RwLock::new(HashMap::new()),
                reconnect: Mutex::new(ReconnectState::default()),
                health,
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to changes for `key`.
    ///
    /// An existing subscription for the same key is torn down first. If the
    /// channel cannot be opened within the heartbeat timeout the handle is
    /// kept in the errored state and a reconnect is scheduled.
    pub async fn subscribe<F>(
        &self,
        key: ResourceKey,
        filter: EventFilter,
        on_event: F,
    ) -> SubscriptionHandle
    where
        F: Fn(RecordChange) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(on_event);

        let (public, opened) = {
            // Held across the open so that concurrent subscribes for one key
            // cannot both leave a live channel behind.
            let mut handles = self.inner.handles.write().await;

            if let Some(mut previous) = handles.remove(&key) {
                previous.close();
                tracing::debug!(
                    key = %key,
                    handle_id = %previous.id,
                    "Replaced existing subscription"
                );
            }

            let mut handle = ConnectionHandle::new(key.clone(), filter, callback);
            let opened = self.inner.open_handle(&mut handle).await;
            let public = handle.public();
            handles.insert(key, handle);
            (public, opened)
        };

        match opened {
            Ok(()) => {
                tracing::info!(key = %public.key, handle_id = %public.id, "Subscribed");
                self.inner.health.send_if_modified(|health| {
                    if *health == ConnectionHealth::Connecting {
                        *health = ConnectionHealth::Healthy;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => {
                tracing::warn!(key = %public.key, error = %e, "Subscribe failed");
                self.inner.schedule_reconnect();
            }
        }

        public
    }

    /// Tear down a subscription. Stale handles (already replaced) are ignored.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut handles = self.inner.handles.write().await;

        let matches = handles
            .get(&handle.key)
            .map(|h| h.id == handle.id)
            .unwrap_or(false);
        if !matches {
            return;
        }

        if let Some(mut removed) = handles.remove(&handle.key) {
            removed.close();
            tracing::debug!(
                key = %handle.key,
                handle_id = %handle.id,
                remaining = handles.len(),
                "Unsubscribed"
            );
        }

        if handles.is_empty() {
            self.inner.cancel_pending_reconnect();
        }
    }

    /// Manual refresh: reset the failure counter and reopen every handle now
    pub async fn refresh(&self) {
        {
            let mut state = self.inner.reconnect_state();
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
            state.failures = 0;
            state.degraded = false;
        }

        tracing::info!("Manual refresh requested");
        self.inner.reconnect_all().await;
    }

    /// Tear down every handle and cancel any pending reconnect
    pub async fn shutdown(&self) {
        self.inner.cancel_pending_reconnect();

        let mut handles = self.inner.handles.write().await;
        let count = handles.len();
        for (_, mut handle) in handles.drain() {
            handle.close();
        }

        tracing::info!(closed = count, "Connection manager shut down");
    }

    /// Watch the health of the shared session
    pub fn health(&self) -> watch::Receiver<ConnectionHealth> {
        self.inner.health.subscribe()
    }

    pub fn current_health(&self) -> ConnectionHealth {
        *self.inner.health.borrow()
    }

    pub async fn handle(&self, key: &ResourceKey) -> Option<HandleSnapshot> {
        let handles = self.inner.handles.read().await;
        handles.get(key).map(ConnectionHandle::snapshot)
    }

    pub async fn stats(&self) -> ConnectionStats {
        let handles = self.inner.handles.read().await;
        let mut stats = ConnectionStats {
            total: handles.len(),
            consecutive_failures: self.inner.reconnect_state().failures,
            ..Default::default()
        };

        for handle in handles.values() {
            match handle.status {
                HandleStatus::Subscribed => stats.subscribed += 1,
                HandleStatus::Connecting => stats.connecting += 1,
                HandleStatus::Errored => stats.errored += 1,
                HandleStatus::Closed => {}
            }
        }

        stats
    }
}

impl Inner {
    fn reconnect_state(&self) -> MutexGuard<'_, ReconnectState> {
        self.reconnect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_pending_reconnect(&self) {
        if let Some(pending) = self.reconnect_state().pending.take() {
            pending.abort();
            tracing::debug!("Cancelled pending reconnect");
        }
    }

    /// Open the transport stream for a handle and start forwarding it. An open
    /// that outlives the heartbeat timeout counts as failed.
    async fn open_handle(
        self: &Arc<Self>,
        handle: &mut ConnectionHandle,
    ) -> Result<(), TransportError> {
        handle.stop_pump();
        handle.status = HandleStatus::Connecting;

        let opened = tokio::time::timeout(
            self.heartbeat_timeout,
            self.transport.open(&handle.key, &handle.filter),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));

        match opened {
            Ok(stream) => {
                let channel_id = self.next_channel.fetch_add(1, Ordering::Relaxed);
                handle.channel_id = channel_id;
                handle.status = HandleStatus::Subscribed;
                handle.last_subscribed_at = Some(self.clock.now());

                let pump = tokio::spawn(pump(
                    Arc::downgrade(self),
                    handle.key.clone(),
                    channel_id,
                    handle.filter.clone(),
                    Arc::clone(&handle.callback),
                    stream,
                    self.heartbeat_timeout,
                ));
                handle.attach_pump(pump);
                Ok(())
            }
            Err(e) => {
                handle.status = HandleStatus::Errored;
                Err(e)
            }
        }
    }

    /// Called by a pump when its stream fails
    async fn on_stream_failed(
        self: &Arc<Self>,
        key: ResourceKey,
        channel_id: u64,
        error: TransportError,
    ) {
        {
            let mut handles = self.handles.write().await;
            match handles.get_mut(&key) {
                Some(handle)
                    if handle.channel_id == channel_id
                        && handle.status == HandleStatus::Subscribed =>
                {
                    handle.status = HandleStatus::Errored;
                    handle.stop_pump();
                }
                _ => return,
            }
        }

        tracing::warn!(key = %key, error = %error, "Push stream failed");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut state = self.reconnect_state();
        if state.pending.is_some() || state.degraded {
            return;
        }

        let attempt = state.failures + 1;
        let delay = self.policy.delay_for(state.failures);
        self.health.send_replace(ConnectionHealth::Reconnecting {
            attempt,
            retry_in: delay,
        });

        tracing::info!(attempt, delay = ?delay, "Scheduling reconnect");

        let weak = Arc::downgrade(self);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_all().await;
            }
        }));
    }

    /// Reopen every registered handle
    async fn reconnect_all(self: &Arc<Self>) {
        let mut handles = self.handles.write().await;
        self.reconnect_state().pending = None;

        let mut failed = 0usize;
        for handle in handles.values_mut() {
            if let Err(e) = self.open_handle(handle).await {
                failed += 1;
                tracing::debug!(key = %handle.key, error = %e, "Reopen failed");
            }
        }

        let failures = {
            let mut state = self.reconnect_state();
            if failed == 0 {
                if state.failures > 0 {
                    tracing::info!(
                        previous_failures = state.failures,
                        handles = handles.len(),
                        "Reconnected"
                    );
                }
                state.failures = 0;
                state.degraded = false;
                self.health.send_replace(ConnectionHealth::Healthy);
            } else {
                state.failures += 1;
                if self.policy.is_exhausted(state.failures) {
                    state.degraded = true;
                    self.health.send_replace(ConnectionHealth::Degraded {
                        failures: state.failures,
                    });
                    tracing::error!(
                        failures = state.failures,
                        errored_handles = failed,
                        "Reconnect attempts exhausted, connection degraded"
                    );
                } else {
                    tracing::warn!(
                        failures = state.failures,
                        errored_handles = failed,
                        "Reconnect attempt failed"
                    );
                }
            }
            state.failures
        };

        for handle in handles.values_mut() {
            handle.reconnect_attempts = failures;
        }

        let any_errored = handles.values().any(|h| h.status == HandleStatus::Errored);
        drop(handles);

        if any_errored {
            self.schedule_reconnect();
        }
    }
}

/// Forward one stream to its callback until it fails or goes silent
async fn pump(
    inner: Weak<Inner>,
    key: ResourceKey,
    channel_id: u64,
    filter: EventFilter,
    callback: EventCallback,
    mut stream: PushStream,
    heartbeat_timeout: Duration,
) {
    let error = loop {
        match tokio::time::timeout(heartbeat_timeout, stream.recv()).await {
            Ok(Some(Ok(PushFrame::Change(change)))) => {
                if filter.matches(&change) {
                    callback(change);
                }
            }
            Ok(Some(Ok(PushFrame::Heartbeat))) => {}
            Ok(Some(Err(e))) => break e,
            Ok(None) => break TransportError::Closed,
            Err(_) => break TransportError::Timeout,
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.on_stream_failed(key, channel_id, error).await;
    }
}
