//! Push channel types
//!
//! Defines the change notifications delivered by the backing store's push
//! channel and the transport interface the connection manager drives.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use helpdesk_shared::{ConversationId, TicketId, UserId};

use crate::error::TransportError;

// =============================================================================
// Subscription keys and filters
// =============================================================================

/// Identifies one logical subscription (entity + consumer)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn conversation_messages(conversation_id: ConversationId) -> Self {
        Self(format!("messages:{conversation_id}"))
    }

    pub fn conversation_typing(conversation_id: ConversationId) -> Self {
        Self(format!("typing:{conversation_id}"))
    }

    pub fn ticket_activity(ticket_id: TicketId) -> Self {
        Self(format!("activity:{ticket_id}"))
    }

    pub fn agent_inbox(agent_id: UserId, stream: &str) -> Self {
        Self(format!("inbox:{agent_id}:{stream}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which changes a subscription wants
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    pub table: String,
    /// Empty means every kind
    pub kinds: Vec<ChangeKind>,
    /// Optional `column = value` predicate on the record
    pub column_eq: Option<(String, Value)>,
}

impl EventFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kinds: Vec::new(),
            column_eq: None,
        }
    }

    pub fn on(mut self, kind: ChangeKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.column_eq = Some((column.into(), value));
        self
    }

    /// Returns true if the change passes this filter.
    ///
    /// Deletes are matched against the old record, since the new one is empty.
    pub fn matches(&self, change: &RecordChange) -> bool {
        if change.table != self.table {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&change.kind) {
            return false;
        }

        match &self.column_eq {
            None => true,
            Some((column, expected)) => {
                let source = match change.kind {
                    ChangeKind::Delete => change.old_record.as_ref().unwrap_or(&change.record),
                    _ => &change.record,
                };
                source.get(column) == Some(expected)
            }
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// One create/update/delete notification from the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub table: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Option<Value>,
}

impl RecordChange {
    pub fn insert(table: impl Into<String>, record: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.into(),
            record,
            old_record: None,
        }
    }

    pub fn update(table: impl Into<String>, record: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: table.into(),
            record,
            old_record: None,
        }
    }

    pub fn delete(table: impl Into<String>, old_record: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            record: Value::Null,
            old_record: Some(old_record),
        }
    }

    /// Deserialize the new record into a domain type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.record)
    }

    /// Deserialize the old record (deletes)
    pub fn decode_old<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.old_record.as_ref().map(T::deserialize)
    }
}

/// Frame delivered on an open push stream
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    Change(RecordChange),
    /// Keep-alive with no payload
    Heartbeat,
}

pub type PushStream = mpsc::UnboundedReceiver<Result<PushFrame, TransportError>>;

/// Callback invoked for every matching change
pub type EventCallback = Arc<dyn Fn(RecordChange) + Send + Sync>;

/// Push-notification channel of the backing store.
///
/// Delivery is at-least-once and a stream may go silent without closing;
/// callers detect that through missing heartbeats.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, key: &ResourceKey, filter: &EventFilter)
        -> Result<PushStream, TransportError>;
}

// =============================================================================
// Table names
// =============================================================================

pub mod tables {
    pub const MESSAGES: &str = "ticket_messages";
    pub const ACTIVITY: &str = "ticket_activity";
    pub const TYPING: &str = "ticket_typing_indicators";
    pub const TICKETS: &str = "support_tickets";
}
