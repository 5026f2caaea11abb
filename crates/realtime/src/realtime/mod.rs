//! Push subscriptions
//!
//! - **Events**: change notifications and the transport interface
//! - **Handle**: per-subscription bookkeeping
//! - **Manager**: one subscription per key, reconnect with backoff, health
//! - **Local**: in-process transport for development and tests

pub mod events;
pub mod handle;
pub mod local;
pub mod manager;

pub use events::{
    tables, ChangeKind, EventCallback, EventFilter, PushFrame, PushStream, PushTransport,
    RecordChange, ResourceKey,
};
pub use handle::{HandleSnapshot, HandleStatus, SubscriptionHandle};
pub use local::LocalPushHub;
pub use manager::{ConnectionHealth, ConnectionManager, ConnectionStats};
