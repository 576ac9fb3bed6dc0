//! Session store error types.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// The project would grow past its storage quota.
    #[error("Project size {used} bytes exceeds quota of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    /// A single file body is over the per-file limit.
    #[error("File of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    /// Hydration could not list the project.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
