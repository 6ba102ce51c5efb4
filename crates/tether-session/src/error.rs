//! Session-level error type.

use thiserror::Error;

/// Error type for session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Configuration error
    #[error("Config error: {0}")]
    Core(#[from] tether_core::CoreError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] tether_storage::StorageError),

    /// Gateway transport error
    #[error("Gateway error: {0}")]
    Gateway(#[from] tether_gateway::GatewayError),

    /// Offline queue error
    #[error("Queue error: {0}")]
    Queue(#[from] tether_queue::QueueError),

    /// Api client error
    #[error("Api error: {0}")]
    Api(#[from] tether_api::ApiError),
}

/// Result type alias using SessionError.
pub type SessionResult<T> = Result<T, SessionError>;
