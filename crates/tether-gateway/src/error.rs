//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// No credential available for connecting
    #[error("No credential available")]
    MissingCredential,

    /// Not connected to the gateway
    #[error("Not connected to gateway")]
    NotConnected,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Send error
    #[error("Failed to send message: {0}")]
    Send(String),
}

/// Result type alias using GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;
