//! Error types for the helpdesk backing store

use thiserror::Error;

/// Failure reported by the data store.
///
/// Every write can be rejected by row-level authorization or a constraint,
/// so callers treat all of these as recoverable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// The target table lacks a column the write referenced (schema drift).
    #[error("Unknown column: {0}")]
    UndefinedColumn(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Returns true if retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Failure reported by the file storage collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FileStorageError {
    #[error("Storage request failed: {0}")]
    Network(String),

    #[error("Storage rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
