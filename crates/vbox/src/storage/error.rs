//! Remote storage error types.

use thiserror::Error;

/// Result type for remote storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors talking to the object storage worker.
#[derive(Debug, Error)]
pub enum StorageError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Connection failed.
    #[error("Failed to connect to storage at {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// The worker answered with a non-success status.
    #[error("Storage returned {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    /// Object not found.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Local backend failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}
