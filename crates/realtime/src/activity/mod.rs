//! Ticket activity: parsing, deduplication and the live timeline

pub mod dedup;
pub mod kind;
pub mod timeline;

pub use dedup::{Deduplicator, WindowMode};
pub use kind::{ActivityEvent, ActivityKind};
pub use timeline::ActivityTimeline;
