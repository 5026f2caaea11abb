//! Ordered conversation state
//!
//! Holds pending and confirmed messages. Confirmed messages are ordered by
//! server timestamp; a pending message sorts after every confirmed message
//! with an earlier or equal timestamp.

use std::cmp::Ordering;

use time::OffsetDateTime;
use uuid::Uuid;

use helpdesk_shared::{Message, MessageId, ReplySummary};

/// Two-phase delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Shown optimistically, carries a temporary id
    Pending,
    /// Persisted, carries the server id
    Confirmed,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Confirmed => 0,
            DeliveryState::Pending => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub message: Message,
    pub state: DeliveryState,
}

impl ChatEntry {
    fn order(&self, other: &ChatEntry) -> Ordering {
        self.message
            .created_at
            .cmp(&other.message.created_at)
            .then_with(|| self.state.rank().cmp(&other.state.rank()))
            .then_with(|| self.message.id.to_string().cmp(&other.message.id.to_string()))
    }
}

/// Result of replacing a pending message with its confirmed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The pending entry now carries the confirmed record
    Replaced,
    /// The confirmed record was already present; the pending entry was dropped
    AlreadyConfirmed,
    /// No pending entry with that id (e.g. the view was torn down)
    Missing,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    entries: Vec<ChatEntry>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatEntry> {
        self.position(id).map(|i| &self.entries[i])
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| &e.message.id == id)
    }

    fn insert_sorted(&mut self, entry: ChatEntry) {
        let index = self
            .entries
            .partition_point(|existing| existing.order(&entry) != Ordering::Greater);
        self.entries.insert(index, entry);
    }

    pub fn insert_pending(&mut self, message: Message) {
        self.insert_sorted(ChatEntry {
            message,
            state: DeliveryState::Pending,
        });
    }

    /// Insert a confirmed message; returns false if its id is already present
    pub fn insert_confirmed(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.insert_sorted(ChatEntry {
            message,
            state: DeliveryState::Confirmed,
        });
        true
    }

    /// Swap a pending entry for its confirmed record in one step
    pub fn reconcile(&mut self, temp_id: &MessageId, mut confirmed: Message) -> Reconciliation {
        let Some(index) = self.position(temp_id) else {
            return Reconciliation::Missing;
        };

        if self.contains(&confirmed.id) {
            self.entries.remove(index);
            return Reconciliation::AlreadyConfirmed;
        }

        let pending = self.entries.remove(index);
        if confirmed.reply_preview.is_none() {
            confirmed.reply_preview = pending.message.reply_preview;
        }
        self.insert_sorted(ChatEntry {
            message: confirmed,
            state: DeliveryState::Confirmed,
        });
        Reconciliation::Replaced
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<ChatEntry> {
        self.position(id).map(|i| self.entries.remove(i))
    }

    /// Replace a message with a newer copy of itself; returns the stored copy
    pub fn apply_update(&mut self, mut message: Message) -> Option<Message> {
        let index = self.position(&message.id)?;
        let previous = self.entries.remove(index);
        if message.reply_preview.is_none() {
            message.reply_preview = previous.message.reply_preview;
        }
        let stored = message.clone();
        self.insert_sorted(ChatEntry {
            message,
            state: previous.state,
        });
        Some(stored)
    }

    /// Apply a local edit, returning the previous copy for rollback
    pub fn edit_body(
        &mut self,
        id: &MessageId,
        body: &str,
        edited_at: OffsetDateTime,
    ) -> Option<(Message, Message)> {
        let index = self.position(id)?;
        let entry = &mut self.entries[index];
        let previous = entry.message.clone();
        entry.message.body = body.to_string();
        entry.message.edited = true;
        entry.message.edited_at = Some(edited_at);
        Some((previous, entry.message.clone()))
    }

    /// Put back a message copy captured before an edit
    pub fn restore(&mut self, message: Message) -> bool {
        match self.position(&message.id) {
            Some(index) => {
                self.entries[index].message = message;
                true
            }
            None => false,
        }
    }

    /// Attach reply context to every message replying to `target` that lacks it
    pub fn patch_reply_preview(&mut self, target: Uuid, summary: &ReplySummary) -> Vec<Message> {
        self.entries
            .iter_mut()
            .filter(|e| e.message.reply_to == Some(target) && e.message.reply_preview.is_none())
            .map(|e| {
                e.message.reply_preview = Some(summary.clone());
                e.message.clone()
            })
            .collect()
    }
}
