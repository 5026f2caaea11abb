//! Helpdesk Shared Types and Utilities
//!
//! This crate contains the domain types, store errors and collaborator traits
//! shared by the realtime synchronization layer and the background worker.

pub mod db;
pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use db::*;
pub use error::*;
pub use memory::InMemoryStore;
pub use store::*;
pub use types::*;
