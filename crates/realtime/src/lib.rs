//! Helpdesk Realtime Library
//!
//! Keeps a ticket's conversation, typing presence, lifecycle countdown and
//! activity timeline consistent across concurrently connected clients.
//!
//! - **Realtime**: push subscriptions with reconnect and health reporting
//! - **Chat**: optimistic sends, reconciliation, remote merge and edits
//! - **Typing**: self-expiring presence facts
//! - **Activity**: deduplicated ticket timeline
//! - **Lifecycle**: auto-close countdowns
//! - **Notifications**: per-agent attention counts

pub mod activity;
pub mod backoff;
pub mod chat;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notifications;
pub mod realtime;
pub mod storage;
pub mod telemetry;
pub mod typing;
pub mod view;

pub use activity::{ActivityEvent, ActivityKind, ActivityTimeline, Deduplicator, WindowMode};
pub use backoff::ReconnectPolicy;
pub use chat::{ChatBackends, ConversationUpdate, Draft, MessageSynchronizer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AutoCloseSettings, Config, ConfigError, MAX_AUTO_CLOSE_HOURS};
pub use error::{Notice, NoticeKind, SyncError, SyncResult, TransportError};
pub use lifecycle::{AutoCloseOutcome, AutoCloseScheduler, Countdown};
pub use notifications::{AttentionSummary, NotificationAggregator};
pub use realtime::{ConnectionHealth, ConnectionManager, LocalPushHub};
pub use storage::StorageClient;
pub use telemetry::{init_tracing, LogFormat};
pub use typing::{TypingSettings, TypingTracker};
pub use view::{ConversationView, ViewBackends, ViewSettings};
