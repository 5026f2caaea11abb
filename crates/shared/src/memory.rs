//! In-memory backend
//!
//! Implements every store trait over process-local maps. Used for local
//! development and as the base of test doubles.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{FileStorageError, StoreError, StoreResult};
use crate::store::{
    ActivityStore, FileStorage, MessageStore, ReadMarkerStore, SettingsStore, StoredObject,
    TicketStore, TypingStore,
};
use crate::types::{
    ActivityRecord, CloseOutcome, ConversationId, EditFields, Message, MessageEdit, MessageId,
    NewActivity, NewMessage, ReplySummary, TicketId, TicketLifecycle, TicketStatus, TypingFact,
    UserId,
};

/// Maximum snippet length for reply summaries
const SNIPPET_CHARS: usize = 80;

#[derive(Default)]
struct MemoryData {
    messages: Vec<Message>,
    activity: Vec<ActivityRecord>,
    tickets: HashMap<TicketId, TicketLifecycle>,
    typing: HashMap<(ConversationId, UserId), TypingFact>,
    read_markers: HashMap<(UserId, TicketId), OffsetDateTime>,
    settings: HashMap<String, String>,
    files: HashMap<String, Vec<u8>>,
}

/// Thread-safe in-memory store
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<MemoryData>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, MemoryData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a configuration value
    pub fn set_setting(&self, key: &str, value: &str) {
        self.data().settings.insert(key.to_string(), value.to_string());
    }

    /// Insert or replace a ticket's lifecycle state
    pub fn put_ticket(&self, lifecycle: TicketLifecycle) {
        self.data().tickets.insert(lifecycle.ticket_id, lifecycle);
    }

    pub fn ticket(&self, ticket_id: TicketId) -> Option<TicketLifecycle> {
        self.data().tickets.get(&ticket_id).cloned()
    }

    /// Insert a confirmed message directly, bypassing id assignment
    pub fn put_message(&self, message: Message) {
        self.data().messages.push(message);
    }

    pub fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.data()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Insert an activity row as-is (timestamps are not rewritten)
    pub fn put_activity(&self, record: ActivityRecord) {
        self.data().activity.push(record);
    }

    pub fn activity(&self, ticket_id: TicketId) -> Vec<ActivityRecord> {
        self.data()
            .activity
            .iter()
            .filter(|a| a.ticket_id == ticket_id)
            .cloned()
            .collect()
    }

    pub fn typing_fact(&self, conversation_id: ConversationId, user_id: UserId) -> Option<TypingFact> {
        self.data().typing.get(&(conversation_id, user_id)).cloned()
    }

    pub fn read_marker(&self, agent_id: UserId, ticket_id: TicketId) -> Option<OffsetDateTime> {
        self.data().read_markers.get(&(agent_id, ticket_id)).copied()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.data().files.get(path).cloned()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<Message> {
        let confirmed = Message {
            id: MessageId::Server(Uuid::new_v4()),
            conversation_id: message.conversation_id,
            author_id: message.author_id,
            author_name: message.author_name.clone(),
            author_role: message.author_role,
            body: message.body.clone(),
            attachments: message.attachments.clone(),
            audio_url: message.audio_url.clone(),
            audio_duration_secs: message.audio_duration_secs,
            reply_to: message.reply_to,
            reply_preview: None,
            created_at: OffsetDateTime::now_utc(),
            edited: false,
            edited_at: None,
        };
        self.data().messages.push(confirmed.clone());
        Ok(confirmed)
    }

    async fn update_message(&self, id: Uuid, edit: &MessageEdit) -> StoreResult<Message> {
        let mut data = self.data();
        let message = data
            .messages
            .iter_mut()
            .find(|m| m.id == MessageId::Server(id))
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;

        message.body = edit.body.clone();
        if edit.fields == EditFields::Full {
            message.edited = true;
            message.edited_at = Some(edit.edited_at);
        }
        Ok(message.clone())
    }

    async fn message_summary(&self, id: Uuid) -> StoreResult<Option<ReplySummary>> {
        Ok(self
            .data()
            .messages
            .iter()
            .find(|m| m.id == MessageId::Server(id))
            .map(|m| ReplySummary {
                message_id: id,
                author_name: m.author_name.clone(),
                snippet: m.body.chars().take(SNIPPET_CHARS).collect(),
            }))
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let mut messages = self.messages(conversation_id);
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}

#[async_trait]
impl ActivityStore for InMemoryStore {
    async fn record_activity(&self, activity: &NewActivity) -> StoreResult<ActivityRecord> {
        let record = ActivityRecord {
            id: Uuid::new_v4(),
            ticket_id: activity.ticket_id,
            activity_type: activity.activity_type.clone(),
            actor_id: activity.actor_id,
            description: activity.description.clone(),
            created_at: Some(OffsetDateTime::now_utc()),
        };
        self.data().activity.push(record.clone());
        Ok(record)
    }

    async fn list_activity(&self, ticket_id: TicketId) -> StoreResult<Vec<ActivityRecord>> {
        Ok(self.activity(ticket_id))
    }
}

#[async_trait]
impl TicketStore for InMemoryStore {
    async fn fetch_lifecycle(&self, ticket_id: TicketId) -> StoreResult<Option<TicketLifecycle>> {
        Ok(self.ticket(ticket_id))
    }

    async fn list_resolved(&self) -> StoreResult<Vec<TicketLifecycle>> {
        Ok(self
            .data()
            .tickets
            .values()
            .filter(|t| t.status == TicketStatus::Resolved)
            .cloned()
            .collect())
    }

    async fn close_if_resolved(
        &self,
        ticket_id: TicketId,
        closed_at: OffsetDateTime,
    ) -> StoreResult<CloseOutcome> {
        let mut data = self.data();
        match data.tickets.get_mut(&ticket_id) {
            Some(ticket) if ticket.is_auto_close_eligible() => {
                ticket.status = TicketStatus::Closed;
                ticket.closed_at = Some(closed_at);
                Ok(CloseOutcome::Closed(ticket.clone()))
            }
            other => Ok(CloseOutcome::NotEligible {
                current: other.map(|t| t.clone()),
            }),
        }
    }
}

#[async_trait]
impl TypingStore for InMemoryStore {
    async fn upsert_typing(&self, fact: &TypingFact) -> StoreResult<()> {
        self.data()
            .typing
            .insert((fact.conversation_id, fact.user_id), fact.clone());
        Ok(())
    }

    async fn clear_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> StoreResult<()> {
        self.data().typing.remove(&(conversation_id, user_id));
        Ok(())
    }
}

#[async_trait]
impl ReadMarkerStore for InMemoryStore {
    async fn write_read_marker(
        &self,
        agent_id: UserId,
        ticket_id: TicketId,
        read_at: OffsetDateTime,
    ) -> StoreResult<()> {
        self.data()
            .read_markers
            .insert((agent_id, ticket_id), read_at);
        Ok(())
    }

    async fn read_markers(&self, agent_id: UserId) -> StoreResult<Vec<(TicketId, OffsetDateTime)>> {
        Ok(self
            .data()
            .read_markers
            .iter()
            .filter(|((agent, _), _)| *agent == agent_id)
            .map(|((_, ticket), at)| (*ticket, *at))
            .collect())
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.data().settings.get(key).cloned())
    }
}

#[async_trait]
impl FileStorage for InMemoryStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<StoredObject, FileStorageError> {
        if path.is_empty() || path.starts_with('/') {
            return Err(FileStorageError::InvalidPath(path.to_string()));
        }
        self.data().files.insert(path.to_string(), bytes);
        Ok(StoredObject {
            path: path.to_string(),
        })
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{}", path)
    }

    async fn remove(&self, paths: &[String]) -> Result<(), FileStorageError> {
        let mut data = self.data();
        for path in paths {
            data.files.remove(path);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::AuthorRole;

    fn resolved_ticket() -> TicketLifecycle {
        TicketLifecycle {
            ticket_id: TicketId::new(),
            status: TicketStatus::Resolved,
            resolved_at: Some(OffsetDateTime::now_utc()),
            closed_at: None,
            reopen_count: 0,
        }
    }

    #[tokio::test]
    async fn test_close_if_resolved_is_compare_and_set() {
        let store = InMemoryStore::new();
        let ticket = resolved_ticket();
        store.put_ticket(ticket.clone());

        let now = OffsetDateTime::now_utc();
        let first = store.close_if_resolved(ticket.ticket_id, now).await.unwrap();
        assert!(matches!(first, CloseOutcome::Closed(_)));

        let second = store.close_if_resolved(ticket.ticket_id, now).await.unwrap();
        match second {
            CloseOutcome::NotEligible { current: Some(current) } => {
                assert_eq!(current.status, TicketStatus::Closed);
            }
            other => panic!("Expected NotEligible, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insert_message_assigns_server_id() {
        let store = InMemoryStore::new();
        let conversation_id = ConversationId::new();
        let confirmed = store
            .insert_message(&NewMessage {
                conversation_id,
                author_id: UserId::new(),
                author_name: "Ana".to_string(),
                author_role: AuthorRole::EndUser,
                body: "Hi".to_string(),
                attachments: Vec::new(),
                audio_url: None,
                audio_duration_secs: None,
                reply_to: None,
            })
            .await
            .unwrap();

        assert!(confirmed.id.server_id().is_some());
        assert_eq!(store.messages(conversation_id).len(), 1);
    }

    #[tokio::test]
    async fn test_body_only_edit_leaves_edit_flags() {
        let store = InMemoryStore::new();
        let confirmed = store
            .insert_message(&NewMessage {
                conversation_id: ConversationId::new(),
                author_id: UserId::new(),
                author_name: "Ana".to_string(),
                author_role: AuthorRole::EndUser,
                body: "Hi".to_string(),
                attachments: Vec::new(),
                audio_url: None,
                audio_duration_secs: None,
                reply_to: None,
            })
            .await
            .unwrap();
        let id = confirmed.id.server_id().unwrap();

        let edited = store
            .update_message(
                id,
                &MessageEdit {
                    body: "Hi there".to_string(),
                    edited_at: OffsetDateTime::now_utc(),
                    fields: EditFields::BodyOnly,
                },
            )
            .await
            .unwrap();

        assert_eq!(edited.body, "Hi there");
        assert!(!edited.edited);
    }
}
