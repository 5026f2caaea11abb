//! Synchronization error types and user-facing notices

use helpdesk_shared::{FileStorageError, StoreError};

/// Failure of the push transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Timed out waiting for the push channel")]
    Timeout,
    #[error("Push channel closed")]
    Closed,
    #[error("Subscription rejected: {0}")]
    Rejected(String),
}

/// Error taxonomy of the synchronization layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    // Transport errors, recovered locally by reconnecting
    #[error("Connection error: {0}")]
    Transport(#[from] TransportError),
    #[error("Connection degraded after {failures} failed reconnects")]
    Degraded { failures: u32 },

    // Persistence errors
    #[error("Failed to save: {0}")]
    Persistence(#[from] StoreError),
    #[error("Upload failed: {0}")]
    Upload(#[from] FileStorageError),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Only the author can edit this message")]
    NotAuthor,

    /// Another actor already moved the entity to the desired state
    #[error("Already changed: {0}")]
    StaleState(String),
}

/// How a notice is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Transient, non-blocking, may be dismissed
    Dismissible,
    /// Stays until the user acts (e.g. refreshes)
    Persistent,
    /// Shown next to the input that caused it
    Inline,
}

/// User-visible rendering of an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub code: &'static str,
    pub message: String,
}

impl SyncError {
    /// Map the error to what the user sees, or `None` for silent outcomes
    pub fn notice(&self) -> Option<Notice> {
        let (kind, code, message) = match self {
            SyncError::Transport(_) => (
                NoticeKind::Dismissible,
                "CONNECTION_INTERRUPTED",
                "Connection interrupted, reconnecting".to_string(),
            ),
            SyncError::Degraded { .. } => (
                NoticeKind::Persistent,
                "CONNECTION_DEGRADED",
                "Connection degraded, try refreshing".to_string(),
            ),
            SyncError::Persistence(StoreError::PermissionDenied(_)) => (
                NoticeKind::Dismissible,
                "PERMISSION_DENIED",
                "You don't have permission to do that".to_string(),
            ),
            SyncError::Persistence(_) => (
                NoticeKind::Dismissible,
                "SAVE_FAILED",
                "Couldn't save your change, please try again".to_string(),
            ),
            SyncError::Upload(_) => (
                NoticeKind::Dismissible,
                "UPLOAD_FAILED",
                "Couldn't upload the file, please try again".to_string(),
            ),
            SyncError::Validation(msg) => (NoticeKind::Inline, "VALIDATION_ERROR", msg.clone()),
            SyncError::NotAuthor => (NoticeKind::Inline, "NOT_AUTHOR", self.to_string()),
            SyncError::StaleState(_) => return None,
        };

        Some(Notice {
            kind,
            code,
            message,
        })
    }

    /// Returns true if the user may retry the same action
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Persistence(_) | SyncError::Upload(_) => true,
            SyncError::Degraded { .. } => true,
            SyncError::Validation(_) | SyncError::NotAuthor | SyncError::StaleState(_) => false,
        }
    }
}

/// Result type alias for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;
