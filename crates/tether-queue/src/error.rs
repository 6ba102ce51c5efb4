//! Queue error types.

use thiserror::Error;

/// Queue error type.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] tether_storage::StorageError),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using QueueError.
pub type QueueResult<T> = Result<T, QueueError>;
