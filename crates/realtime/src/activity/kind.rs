//! Activity kinds
//!
//! Activity rows carry a string tag and a free-text description. They are
//! parsed once into [`ActivityKind`] so that rendering and deduplication
//! never branch on raw strings.

use time::OffsetDateTime;
use uuid::Uuid;

use helpdesk_shared::{ActivityRecord, TicketId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Created,
    Assigned,
    Resolved,
    Closed,
    Referred { target: String },
    ReferralAccepted,
    ReferralDeclined,
    DetailsUpdated,
    StatusChanged { detail: String },
    Escalated,
    Reopened,
    MessageSent,
    /// Unrecognized tag, kept verbatim
    Other(String),
}

impl ActivityKind {
    /// Resolve a stored tag and description into a kind
    pub fn parse(activity_type: &str, description: &str) -> Self {
        match activity_type {
            "created" => ActivityKind::Created,
            "assigned" => ActivityKind::Assigned,
            "resolved" => ActivityKind::Resolved,
            "closed" => ActivityKind::Closed,
            "referred" => ActivityKind::Referred {
                target: description
                    .strip_prefix("Referred to ")
                    .unwrap_or(description)
                    .trim()
                    .to_string(),
            },
            "referral_accepted" => ActivityKind::ReferralAccepted,
            "referral_declined" => ActivityKind::ReferralDeclined,
            "details_updated" => ActivityKind::DetailsUpdated,
            "status_changed" => ActivityKind::StatusChanged {
                detail: description.trim().to_string(),
            },
            "escalated" => ActivityKind::Escalated,
            "reopened" => ActivityKind::Reopened,
            "message_sent" => ActivityKind::MessageSent,
            other => ActivityKind::Other(other.to_string()),
        }
    }

    /// The stored tag
    pub fn tag(&self) -> &str {
        match self {
            ActivityKind::Created => "created",
            ActivityKind::Assigned => "assigned",
            ActivityKind::Resolved => "resolved",
            ActivityKind::Closed => "closed",
            ActivityKind::Referred { .. } => "referred",
            ActivityKind::ReferralAccepted => "referral_accepted",
            ActivityKind::ReferralDeclined => "referral_declined",
            ActivityKind::DetailsUpdated => "details_updated",
            ActivityKind::StatusChanged { .. } => "status_changed",
            ActivityKind::Escalated => "escalated",
            ActivityKind::Reopened => "reopened",
            ActivityKind::MessageSent => "message_sent",
            ActivityKind::Other(tag) => tag,
        }
    }

    /// Timeline text
    pub fn label(&self) -> String {
        match self {
            ActivityKind::Created => "Ticket created".to_string(),
            ActivityKind::Assigned => "Ticket assigned".to_string(),
            ActivityKind::Resolved => "Ticket resolved".to_string(),
            ActivityKind::Closed => "Ticket closed".to_string(),
            ActivityKind::Referred { target } if target.is_empty() => "Ticket referred".to_string(),
            ActivityKind::Referred { target } => format!("Referred to {target}"),
            ActivityKind::ReferralAccepted => "Referral accepted".to_string(),
            ActivityKind::ReferralDeclined => "Referral declined".to_string(),
            ActivityKind::DetailsUpdated => "Ticket details updated".to_string(),
            ActivityKind::StatusChanged { detail } if detail.is_empty() => {
                "Status changed".to_string()
            }
            ActivityKind::StatusChanged { detail } => detail.clone(),
            ActivityKind::Escalated => "Ticket escalated".to_string(),
            ActivityKind::Reopened => "Ticket reopened".to_string(),
            ActivityKind::MessageSent => "Message sent".to_string(),
            ActivityKind::Other(tag) => tag.replace('_', " "),
        }
    }
}

/// A parsed activity log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub ticket_id: TicketId,
    pub kind: ActivityKind,
    pub actor_id: Option<UserId>,
    pub description: String,
    /// `None` when the stored timestamp was missing or unparseable
    pub created_at: Option<OffsetDateTime>,
}

impl From<ActivityRecord> for ActivityEvent {
    fn from(record: ActivityRecord) -> Self {
        Self {
            id: record.id,
            ticket_id: record.ticket_id,
            kind: ActivityKind::parse(&record.activity_type, &record.description),
            actor_id: record.actor_id,
            description: record.description,
            created_at: record.created_at,
        }
    }
}
