//! Collaborator interfaces consumed by the realtime layer
//!
//! The backing store enforces row-level authorization; implementations
//! surface rejections as [`StoreError`] and never panic on them.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{FileStorageError, StoreResult};
use crate::types::{
    ActivityRecord, CloseOutcome, ConversationId, Message, MessageEdit, NewActivity, NewMessage,
    ReplySummary, TicketId, TicketLifecycle, TypingFact, UserId,
};

/// Persistence for chat messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message and return the confirmed record (server id and timestamp)
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<Message>;

    /// Apply an edit to a confirmed message
    async fn update_message(&self, id: Uuid, edit: &MessageEdit) -> StoreResult<Message>;

    /// Author and snippet of a message, for reply context
    async fn message_summary(&self, id: Uuid) -> StoreResult<Option<ReplySummary>>;

    /// All confirmed messages of a conversation, oldest first
    async fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>>;
}

/// Persistence for the ticket activity log
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn record_activity(&self, activity: &NewActivity) -> StoreResult<ActivityRecord>;

    async fn list_activity(&self, ticket_id: TicketId) -> StoreResult<Vec<ActivityRecord>>;
}

/// Access to server-owned ticket lifecycle state
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn fetch_lifecycle(&self, ticket_id: TicketId) -> StoreResult<Option<TicketLifecycle>>;

    /// Tickets currently in the resolved state
    async fn list_resolved(&self) -> StoreResult<Vec<TicketLifecycle>>;

    /// Close the ticket only if it is still resolved and not yet closed.
    ///
    /// This is a compare-and-set at the data layer; concurrent callers see
    /// exactly one `CloseOutcome::Closed`.
    async fn close_if_resolved(
        &self,
        ticket_id: TicketId,
        closed_at: OffsetDateTime,
    ) -> StoreResult<CloseOutcome>;
}

/// Persistence for typing indicators
#[async_trait]
pub trait TypingStore: Send + Sync {
    async fn upsert_typing(&self, fact: &TypingFact) -> StoreResult<()>;

    async fn clear_typing(&self, conversation_id: ConversationId, user_id: UserId)
        -> StoreResult<()>;
}

/// Per-(agent, ticket) last-read markers
#[async_trait]
pub trait ReadMarkerStore: Send + Sync {
    async fn write_read_marker(
        &self,
        agent_id: UserId,
        ticket_id: TicketId,
        read_at: OffsetDateTime,
    ) -> StoreResult<()>;

    async fn read_markers(&self, agent_id: UserId) -> StoreResult<Vec<(TicketId, OffsetDateTime)>>;
}

/// Read-only key/value settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;
}

/// Object returned by a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub path: String,
}

/// Blob storage for attachments and voice notes
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, FileStorageError>;

    fn public_url(&self, path: &str) -> String;

    async fn remove(&self, paths: &[String]) -> Result<(), FileStorageError>;
}
