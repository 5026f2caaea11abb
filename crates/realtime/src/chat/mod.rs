//! Ticket chat: optimistic sends, reconciliation and remote merge

pub mod audio;
pub mod conversation;
pub mod synchronizer;

use uuid::Uuid;

use helpdesk_shared::{Attachment, Message, MessageId};

use crate::error::Notice;

pub use audio::AudioClip;
pub use conversation::{ChatEntry, ConversationState, DeliveryState, Reconciliation};
pub use synchronizer::{ChatBackends, MessageSynchronizer, PendingSend};

/// Content of a message about to be sent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub audio: Option<AudioClip>,
    pub reply_to: Option<Uuid>,
}

impl Draft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_audio(mut self, audio: AudioClip) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn replying_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

/// Change to the rendered conversation, consumed by the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationUpdate {
    /// A new message, pending or confirmed
    Added(Message),
    /// A pending message now carries its confirmed record
    Reconciled { temp_id: MessageId, message: Message },
    /// An existing message changed in place
    Updated(Message),
    /// A message is gone (failed send)
    Removed { id: MessageId },
    /// Something the user should be told about
    Notice(Notice),
}
