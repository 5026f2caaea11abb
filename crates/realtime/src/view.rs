//! Conversation view
//!
//! Everything one open ticket conversation needs, wired to a shared
//! connection manager. Closing the view removes every subscription it made,
//! stops its timers and sends a best-effort stop-typing signal. Sends already
//! in flight still land in the store.

use std::sync::Arc;

use tokio::sync::mpsc;

use helpdesk_shared::{Conversation, LocalUser, TypingStore};

use crate::activity::{ActivityTimeline, Deduplicator};
use crate::chat::{ChatBackends, ConversationUpdate, MessageSynchronizer};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::SyncResult;
use crate::realtime::ConnectionManager;
use crate::typing::{TypingSettings, TypingTracker};

/// Collaborators of an open conversation
#[derive(Clone)]
pub struct ViewBackends {
    pub chat: ChatBackends,
    pub typing: Arc<dyn TypingStore>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ViewSettings {
    pub typing: TypingSettings,
    pub dedup: Deduplicator,
}

impl ViewSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            typing: TypingSettings {
                ttl: config.typing_ttl(),
                sweep_interval: config.typing_sweep_interval(),
                throttle: config.typing_throttle(),
            },
            dedup: Deduplicator::new(config.dedup_window()),
        }
    }
}

pub struct ConversationView {
    manager: ConnectionManager,
    chat: MessageSynchronizer,
    typing: TypingTracker,
    timeline: ActivityTimeline,
}

impl ConversationView {
    pub async fn open(
        manager: ConnectionManager,
        conversation: Conversation,
        user: LocalUser,
        backends: ViewBackends,
        settings: ViewSettings,
    ) -> SyncResult<(Self, mpsc::UnboundedReceiver<ConversationUpdate>)> {
        Self::open_with_clock(
            manager,
            conversation,
            user,
            backends,
            settings,
            Arc::new(SystemClock),
        )
        .await
    }

    /// Subscribe first, then load, so nothing written in between is missed.
    /// Loads are idempotent with respect to pushes of the same records.
    pub async fn open_with_clock(
        manager: ConnectionManager,
        conversation: Conversation,
        user: LocalUser,
        backends: ViewBackends,
        settings: ViewSettings,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<(Self, mpsc::UnboundedReceiver<ConversationUpdate>)> {
        let activity = backends.chat.activity.clone();
        let (chat, updates) = MessageSynchronizer::with_clock(
            conversation,
            user.clone(),
            backends.chat,
            clock.clone(),
        );
        let typing = TypingTracker::with_clock(
            conversation.id,
            user,
            backends.typing,
            settings.typing,
            clock,
        );
        let timeline = ActivityTimeline::new(conversation.ticket_id, activity, settings.dedup);

        let view = Self {
            manager,
            chat,
            typing,
            timeline,
        };

        view.chat.attach(&view.manager).await;
        view.typing.attach(&view.manager).await;
        view.timeline.attach(&view.manager).await;
        view.typing.start_sweep();

        if let Err(e) = view.load().await {
            tracing::error!(
                conversation_id = %conversation.id,
                error = %e,
                "Failed to load conversation"
            );
            view.close().await;
            return Err(e);
        }

        tracing::info!(
            conversation_id = %conversation.id,
            ticket_id = %conversation.ticket_id,
            "Conversation opened"
        );
        Ok((view, updates))
    }

    async fn load(&self) -> SyncResult<()> {
        self.chat.load_history().await?;
        self.timeline.load().await?;
        Ok(())
    }

    pub fn chat(&self) -> &MessageSynchronizer {
        &self.chat
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn timeline(&self) -> &ActivityTimeline {
        &self.timeline
    }

    pub async fn close(self) {
        let conversation_id = self.chat.conversation().id;

        self.chat.detach(&self.manager).await;
        self.typing.detach(&self.manager).await;
        self.timeline.detach(&self.manager).await;
        self.typing.close().await;

        tracing::info!(conversation_id = %conversation_id, "Conversation closed");
    }
}
