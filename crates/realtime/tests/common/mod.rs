//! Shared fixtures for integration tests
#![allow(dead_code, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use helpdesk_realtime::chat::ChatBackends;
use helpdesk_realtime::{ConnectionManager, LocalPushHub, ReconnectPolicy};
use helpdesk_shared::{
    ActivityRecord, ActivityStore, AuthorRole, Conversation, ConversationId, EditFields,
    FileStorage, FileStorageError, InMemoryStore, LocalUser, Message, MessageEdit, MessageStore,
    NewActivity, NewMessage, ReadMarkerStore, ReplySummary, StoreError, StoreResult, StoredObject,
    TicketId, UserId,
};

/// Wraps `InMemoryStore` and fails selected operations on demand
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    pub fail_inserts: AtomicBool,
    pub fail_activity: AtomicBool,
    /// Full edits fail with `UndefinedColumn`, as against an older schema
    pub legacy_edit_columns: AtomicBool,
    pub fail_edits: AtomicBool,
    pub edit_attempts: AtomicUsize,
    /// Number of upcoming read-marker writes to reject
    pub marker_failures: AtomicUsize,
    pub marker_attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn backends(self: &Arc<Self>) -> ChatBackends {
        ChatBackends {
            messages: self.clone(),
            activity: self.clone(),
            files: self.clone(),
        }
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<Message> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(
                "new row violates row-level security policy".to_string(),
            ));
        }
        self.inner.insert_message(message).await
    }

    async fn update_message(&self, id: Uuid, edit: &MessageEdit) -> StoreResult<Message> {
        self.edit_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        if edit.fields == EditFields::Full && self.legacy_edit_columns.load(Ordering::SeqCst) {
            return Err(StoreError::UndefinedColumn("edited_at".to_string()));
        }
        self.inner.update_message(id, edit).await
    }

    async fn message_summary(&self, id: Uuid) -> StoreResult<Option<ReplySummary>> {
        self.inner.message_summary(id).await
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        self.inner.list_messages(conversation_id).await
    }
}

#[async_trait]
impl ActivityStore for FlakyStore {
    async fn record_activity(&self, activity: &NewActivity) -> StoreResult<ActivityRecord> {
        if self.fail_activity.load(Ordering::SeqCst) {
            return Err(StoreError::Constraint("ticket_activity_ticket_id_fkey".to_string()));
        }
        self.inner.record_activity(activity).await
    }

    async fn list_activity(&self, ticket_id: TicketId) -> StoreResult<Vec<ActivityRecord>> {
        self.inner.list_activity(ticket_id).await
    }
}

#[async_trait]
impl ReadMarkerStore for FlakyStore {
    async fn write_read_marker(
        &self,
        agent_id: UserId,
        ticket_id: TicketId,
        read_at: OffsetDateTime,
    ) -> StoreResult<()> {
        self.marker_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.marker_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.marker_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("timeout".to_string()));
        }
        self.inner
            .write_read_marker(agent_id, ticket_id, read_at)
            .await
    }

    async fn read_markers(&self, agent_id: UserId) -> StoreResult<Vec<(TicketId, OffsetDateTime)>> {
        self.inner.read_markers(agent_id).await
    }
}

#[async_trait]
impl FileStorage for FlakyStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, FileStorageError> {
        self.inner.upload(path, bytes, content_type).await
    }

    fn public_url(&self, path: &str) -> String {
        self.inner.public_url(path)
    }

    async fn remove(&self, paths: &[String]) -> Result<(), FileStorageError> {
        self.inner.remove(paths).await
    }
}

pub fn conversation() -> Conversation {
    Conversation {
        id: ConversationId::new(),
        ticket_id: TicketId::new(),
    }
}

pub fn agent(name: &str) -> LocalUser {
    LocalUser::new(UserId::new(), name, AuthorRole::Agent)
}

pub fn end_user(name: &str) -> LocalUser {
    LocalUser::new(UserId::new(), name, AuthorRole::EndUser)
}

pub fn manager(hub: &LocalPushHub) -> ConnectionManager {
    ConnectionManager::new(
        Arc::new(hub.clone()),
        ReconnectPolicy::default(),
        Duration::from_secs(60),
    )
}

/// Let spawned tasks run to their next suspension point
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
