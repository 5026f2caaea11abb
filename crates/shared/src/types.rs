//! Common types used across the helpdesk realtime layer

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Support ticket ID wrapper
    TicketId
);
id_type!(
    /// Conversation (ticket chat thread) ID wrapper
    ConversationId
);
id_type!(
    /// User ID wrapper, used for end users and agents alike
    UserId
);
id_type!(
    /// Department ID wrapper
    DepartmentId
);

/// Message identifier.
///
/// A message carries a client-generated temporary id until the store confirms
/// it, after which it carries the server-assigned UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Server(Uuid),
    Temp(String),
}

impl MessageId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, MessageId::Temp(_))
    }

    pub fn server_id(&self) -> Option<Uuid> {
        match self {
            MessageId::Server(id) => Some(*id),
            MessageId::Temp(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => id.fmt(f),
            MessageId::Temp(id) => f.write_str(id),
        }
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Role of a conversation participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorRole {
    EndUser,
    Agent,
}

impl AuthorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorRole::EndUser => "end_user",
            AuthorRole::Agent => "agent",
        }
    }
}

impl FromStr for AuthorRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "end_user" | "user" => Ok(AuthorRole::EndUser),
            "agent" | "admin" => Ok(AuthorRole::Agent),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Ticket lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }
}

impl FromStr for TicketStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TicketStatus::Open),
            "in_progress" => Ok(TicketStatus::InProgress),
            "resolved" => Ok(TicketStatus::Resolved),
            "closed" => Ok(TicketStatus::Closed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Returned when a stored string does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

// =============================================================================
// Participants
// =============================================================================

/// The user on whose behalf a client session runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: UserId,
    pub name: String,
    pub role: AuthorRole,
}

impl LocalUser {
    pub fn new(id: UserId, name: impl Into<String>, role: AuthorRole) -> Self {
        Self {
            id,
            name: name.into(),
            role,
        }
    }
}

/// A ticket's conversation thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub ticket_id: TicketId,
}

// =============================================================================
// Messages
// =============================================================================

/// Reference to an already uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    pub url: String,
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Author and snippet of a message being replied to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySummary {
    pub message_id: Uuid,
    pub author_name: String,
    pub snippet: String,
}

/// A chat message, pending or confirmed.
///
/// Field names match the `ticket_messages` record shape delivered by the push
/// channel, so pushed records deserialize directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    #[serde(default)]
    pub author_name: String,
    pub author_role: AuthorRole,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub audio_duration_secs: Option<u32>,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_preview: Option<ReplySummary>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub edited_at: Option<OffsetDateTime>,
}

/// Message content submitted to the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub author_name: String,
    pub author_role: AuthorRole,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub audio_url: Option<String>,
    pub audio_duration_secs: Option<u32>,
    pub reply_to: Option<Uuid>,
}

/// Which columns an edit writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditFields {
    /// body, edited, edited_at
    Full,
    /// body only, for schemas without the edit-tracking columns
    BodyOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEdit {
    pub body: String,
    pub edited_at: OffsetDateTime,
    pub fields: EditFields,
}

// =============================================================================
// Presence
// =============================================================================

/// One user's typing state in one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingFact {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    pub role: AuthorRole,
    pub is_typing: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Activity
// =============================================================================

/// Activity log row as stored.
///
/// `created_at` is read leniently: a missing or unparseable timestamp becomes
/// `None` instead of failing the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub ticket_id: TicketId,
    pub activity_type: String,
    #[serde(default)]
    pub actor_id: Option<UserId>,
    #[serde(default)]
    pub description: String,
    #[serde(default, with = "lenient_timestamp")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewActivity {
    pub ticket_id: TicketId,
    pub activity_type: String,
    pub actor_id: Option<UserId>,
    pub description: String,
}

mod lenient_timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        time::serde::rfc3339::option::serialize(value, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(raw
            .as_ref()
            .and_then(|v| v.as_str())
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok()))
    }
}

// =============================================================================
// Ticket lifecycle
// =============================================================================

/// Server-owned lifecycle fields of a ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketLifecycle {
    /// `id` in `support_tickets` rows delivered by the push channel
    #[serde(alias = "id")]
    pub ticket_id: TicketId,
    pub status: TicketStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub reopen_count: i32,
}

impl TicketLifecycle {
    /// An automatic close may only fire for a resolved, not yet closed ticket
    pub fn is_auto_close_eligible(&self) -> bool {
        self.status == TicketStatus::Resolved
            && self.resolved_at.is_some()
            && self.closed_at.is_none()
    }
}

/// Result of a conditional close request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This request performed the transition
    Closed(TicketLifecycle),
    /// The ticket was no longer eligible; nothing was written
    NotEligible { current: Option<TicketLifecycle> },
}
