//! Message synchronizer
//!
//! Sends chat messages optimistically and reconciles them against the
//! confirmed records, merges messages pushed by other participants, and
//! applies author-only edits with rollback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use helpdesk_shared::{
    ActivityStore, Conversation, EditFields, FileStorage, LocalUser, Message, MessageEdit,
    MessageId, MessageStore, NewActivity, NewMessage, StoreError,
};

use super::conversation::{ChatEntry, ConversationState, Reconciliation};
use super::{ConversationUpdate, Draft};
use crate::clock::{Clock, SystemClock};
use crate::error::{SyncError, SyncResult};
use crate::realtime::{
    tables, ChangeKind, ConnectionManager, EventFilter, RecordChange, ResourceKey,
    SubscriptionHandle,
};

/// Collaborators used by the synchronizer
#[derive(Clone)]
pub struct ChatBackends {
    pub messages: Arc<dyn MessageStore>,
    pub activity: Arc<dyn ActivityStore>,
    pub files: Arc<dyn FileStorage>,
}

/// Background work started by a send
pub struct PendingSend {
    pub temp_id: MessageId,
    tasks: Vec<JoinHandle<()>>,
}

impl PendingSend {
    /// Wait until persistence and reply-context lookups have finished
    pub async fn settled(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

struct Inner {
    conversation: Conversation,
    user: LocalUser,
    backends: ChatBackends,
    clock: Arc<dyn Clock>,
    state: Mutex<ConversationState>,
    updates: mpsc::UnboundedSender<ConversationUpdate>,
    temp_counter: AtomicU64,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

#[derive(Clone)]
pub struct MessageSynchronizer {
    inner: Arc<Inner>,
}

impl MessageSynchronizer {
    pub fn new(
        conversation: Conversation,
        user: LocalUser,
        backends: ChatBackends,
    ) -> (Self, mpsc::UnboundedReceiver<ConversationUpdate>) {
        Self::with_clock(conversation, user, backends, Arc::new(SystemClock))
    }

    pub fn with_clock(
        conversation: Conversation,
        user: LocalUser,
        backends: ChatBackends,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<ConversationUpdate>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        let synchronizer = Self {
            inner: Arc::new(Inner {
                conversation,
                user,
                backends,
                clock,
                state: Mutex::new(ConversationState::new()),
                updates,
                temp_counter: AtomicU64::new(0),
                subscription: Mutex::new(None),
            }),
        };
        (synchronizer, receiver)
    }

    pub fn conversation(&self) -> &Conversation {
        &self.inner.conversation
    }

    /// Current rendered entries, in display order
    pub fn snapshot(&self) -> Vec<ChatEntry> {
        self.inner.state().entries().to_vec()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .state()
            .entries()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Send a message.
    ///
    /// Returns once the pending message is displayed. Validation and upload
    /// failures are returned; persistence runs in the background and reports
    /// through the update stream.
    pub async fn send(&self, draft: Draft) -> SyncResult<PendingSend> {
        let inner = &self.inner;
        let Draft {
            body,
            attachments,
            audio,
            reply_to,
        } = draft;

        let body = body.trim().to_string();
        if body.is_empty() && attachments.is_empty() && audio.is_none() {
            return Err(SyncError::Validation("Message cannot be empty".to_string()));
        }
        if audio.as_ref().is_some_and(|clip| clip.bytes.is_empty()) {
            return Err(SyncError::Validation("Voice note is empty".to_string()));
        }

        let temp_id = inner.next_temp_id();

        // Voice notes have nothing to show until uploaded
        let mut uploaded_path = None;
        let mut audio_url = None;
        let mut audio_duration_secs = None;
        if let Some(clip) = audio {
            let path = format!(
                "{}/voice-{}.{}",
                inner.conversation.id,
                temp_id,
                clip.extension()
            );
            let duration = clip.estimated_duration_secs();

            let stored = inner
                .backends
                .files
                .upload(&path, clip.bytes, &clip.content_type)
                .await
                .map_err(|e| {
                    tracing::error!(
                        conversation_id = %inner.conversation.id,
                        error = %e,
                        "Voice note upload failed"
                    );
                    SyncError::Upload(e)
                })?;

            audio_url = Some(inner.backends.files.public_url(&stored.path));
            audio_duration_secs = Some(duration);
            uploaded_path = Some(stored.path);
        }

        let new_message = NewMessage {
            conversation_id: inner.conversation.id,
            author_id: inner.user.id,
            author_name: inner.user.name.clone(),
            author_role: inner.user.role,
            body,
            attachments,
            audio_url,
            audio_duration_secs,
            reply_to,
        };

        let pending = Message {
            id: temp_id.clone(),
            conversation_id: new_message.conversation_id,
            author_id: new_message.author_id,
            author_name: new_message.author_name.clone(),
            author_role: new_message.author_role,
            body: new_message.body.clone(),
            attachments: new_message.attachments.clone(),
            audio_url: new_message.audio_url.clone(),
            audio_duration_secs: new_message.audio_duration_secs,
            reply_to,
            reply_preview: None,
            created_at: inner.clock.now(),
            edited: false,
            edited_at: None,
        };

        inner.state().insert_pending(pending.clone());
        inner.emit(ConversationUpdate::Added(pending));
        tracing::debug!(
            conversation_id = %inner.conversation.id,
            temp_id = %temp_id,
            "Message displayed optimistically"
        );

        let mut tasks = Vec::with_capacity(2);

        if let Some(target) = reply_to {
            let inner = Arc::clone(inner);
            tasks.push(tokio::spawn(async move {
                inner.fetch_reply_context(target).await;
            }));
        }

        {
            let inner = Arc::clone(inner);
            let temp_id = temp_id.clone();
            tasks.push(tokio::spawn(async move {
                inner.persist(temp_id, new_message, uploaded_path).await;
            }));
        }

        Ok(PendingSend { temp_id, tasks })
    }

    /// Edit one of the local user's confirmed messages.
    ///
    /// The change is shown immediately and rolled back if it cannot be saved.
    pub async fn edit(&self, message_id: Uuid, new_body: &str) -> SyncResult<Message> {
        let inner = &self.inner;
        let body = new_body.trim();
        if body.is_empty() {
            return Err(SyncError::Validation("Message cannot be empty".to_string()));
        }

        let id = MessageId::Server(message_id);
        let edited_at = inner.clock.now();

        let (previous, edited) = {
            let mut state = inner.state();
            let entry = state
                .get(&id)
                .ok_or_else(|| SyncError::Validation("Message not found".to_string()))?;
            if entry.message.author_id != inner.user.id {
                return Err(SyncError::NotAuthor);
            }
            state
                .edit_body(&id, body, edited_at)
                .ok_or_else(|| SyncError::Validation("Message not found".to_string()))?
        };
        inner.emit(ConversationUpdate::Updated(edited.clone()));

        let mut edit = MessageEdit {
            body: body.to_string(),
            edited_at,
            fields: EditFields::Full,
        };

        let result = match inner.backends.messages.update_message(message_id, &edit).await {
            Err(StoreError::UndefinedColumn(column)) => {
                tracing::warn!(
                    message_id = %message_id,
                    column = %column,
                    "Edit columns missing, retrying with body only"
                );
                edit.fields = EditFields::BodyOnly;
                inner.backends.messages.update_message(message_id, &edit).await
            }
            other => other,
        };

        match result {
            Ok(_) => {
                tracing::info!(message_id = %message_id, fields = ?edit.fields, "Message edited");
                Ok(edited)
            }
            Err(e) => {
                tracing::error!(message_id = %message_id, error = %e, "Failed to save edit");
                if inner.state().restore(previous.clone()) {
                    inner.emit(ConversationUpdate::Updated(previous));
                }
                Err(SyncError::Persistence(e))
            }
        }
    }

    /// Merge a pushed message change
    pub fn apply_remote(&self, change: RecordChange) {
        let inner = &self.inner;

        let message: Message = match change.kind {
            ChangeKind::Delete => {
                tracing::debug!(conversation_id = %inner.conversation.id, "Ignoring message delete");
                return;
            }
            ChangeKind::Insert | ChangeKind::Update => match change.decode() {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %inner.conversation.id,
                        error = %e,
                        "Malformed message push"
                    );
                    return;
                }
            },
        };

        if message.conversation_id != inner.conversation.id {
            return;
        }
        if message.author_id == inner.user.id {
            // Already shown through the optimistic path
            return;
        }

        let update = {
            let mut state = inner.state();
            match change.kind {
                ChangeKind::Insert => {
                    let id = message.id.clone();
                    if state.insert_confirmed(message) {
                        state
                            .get(&id)
                            .map(|e| ConversationUpdate::Added(e.message.clone()))
                    } else {
                        None
                    }
                }
                _ => state.apply_update(message).map(ConversationUpdate::Updated),
            }
        };

        match update {
            Some(update) => inner.emit(update),
            None => tracing::debug!(
                conversation_id = %inner.conversation.id,
                "Ignoring duplicate or unknown message push"
            ),
        }
    }

    /// Seed the conversation with stored messages
    pub async fn load_history(&self) -> SyncResult<usize> {
        let inner = &self.inner;
        let stored = inner
            .backends
            .messages
            .list_messages(inner.conversation.id)
            .await?;

        let mut added = Vec::new();
        {
            let mut state = inner.state();
            for message in stored {
                if state.insert_confirmed(message.clone()) {
                    added.push(message);
                }
            }
        }

        let count = added.len();
        for message in added {
            inner.emit(ConversationUpdate::Added(message));
        }

        tracing::debug!(conversation_id = %inner.conversation.id, loaded = count, "Loaded history");
        Ok(count)
    }

    /// Follow pushed messages for this conversation
    pub async fn attach(&self, manager: &ConnectionManager) {
        let conversation_id = self.inner.conversation.id;
        let filter = EventFilter::table(tables::MESSAGES).eq("conversation_id", conversation_id);
        let synchronizer = self.clone();

        let handle = manager
            .subscribe(
                ResourceKey::conversation_messages(conversation_id),
                filter,
                move |change| synchronizer.apply_remote(change),
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
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscription(&self) -> MutexGuard<'_, Option<SubscriptionHandle>> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send to the presentation layer; a closed receiver means the view is gone
    fn emit(&self, update: ConversationUpdate) {
        let _ = self.updates.send(update);
    }

    fn next_temp_id(&self) -> MessageId {
        let millis = self.clock.now().unix_timestamp_nanos() / 1_000_000;
        let sequence = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        MessageId::Temp(format!("temp-{millis}-{sequence}"))
    }

    async fn persist(
        &self,
        temp_id: MessageId,
        message: NewMessage,
        uploaded_path: Option<String>,
    ) {
        match self.backends.messages.insert_message(&message).await {
            Ok(confirmed) => {
                let update = {
                    let mut state = self.state();
                    match state.reconcile(&temp_id, confirmed.clone()) {
                        Reconciliation::Replaced => state.get(&confirmed.id).map(|entry| {
                            ConversationUpdate::Reconciled {
                                temp_id: temp_id.clone(),
                                message: entry.message.clone(),
                            }
                        }),
                        Reconciliation::AlreadyConfirmed => Some(ConversationUpdate::Removed {
                            id: temp_id.clone(),
                        }),
                        Reconciliation::Missing => None,
                    }
                };
                if let Some(update) = update {
                    self.emit(update);
                }

                tracing::info!(
                    conversation_id = %self.conversation.id,
                    temp_id = %temp_id,
                    message_id = %confirmed.id,
                    "Message confirmed"
                );

                self.record_sent_activity(&confirmed).await;
            }
            Err(e) => {
                if self.state().remove(&temp_id).is_some() {
                    self.emit(ConversationUpdate::Removed {
                        id: temp_id.clone(),
                    });
                }

                tracing::error!(
                    conversation_id = %self.conversation.id,
                    temp_id = %temp_id,
                    error = %e,
                    "Failed to send message"
                );

                if let Some(notice) = SyncError::Persistence(e).notice() {
                    self.emit(ConversationUpdate::Notice(notice));
                }

                if let Some(path) = uploaded_path {
                    if let Err(e) = self.backends.files.remove(&[path]).await {
                        tracing::warn!(error = %e, "Failed to remove orphaned voice note");
                    }
                }
            }
        }
    }

    /// Activity logging never fails a send
    async fn record_sent_activity(&self, message: &Message) {
        let description = if message.audio_url.is_some() {
            "Voice note sent"
        } else if !message.attachments.is_empty() && message.body.is_empty() {
            "Attachment sent"
        } else {
            "Message sent"
        };

        let activity = NewActivity {
            ticket_id: self.conversation.ticket_id,
            activity_type: "message_sent".to_string(),
            actor_id: Some(self.user.id),
            description: description.to_string(),
        };

        if let Err(e) = self.backends.activity.record_activity(&activity).await {
            tracing::warn!(
                ticket_id = %self.conversation.ticket_id,
                error = %e,
                "Failed to record message activity"
            );
        }
    }

    async fn fetch_reply_context(&self, target: Uuid) {
        match self.backends.messages.message_summary(target).await {
            Ok(Some(summary)) => {
                let patched = self.state().patch_reply_preview(target, &summary);
                for message in patched {
                    self.emit(ConversationUpdate::Updated(message));
                }
            }
            Ok(None) => {
                tracing::debug!(reply_to = %target, "Reply target not found");
            }
            Err(e) => {
                tracing::warn!(reply_to = %target, error = %e, "Failed to fetch reply context");
            }
        }
    }
}
