//! Request/response error taxonomy.

use thiserror::Error;

/// Error type for request/response operations.
///
/// Clonable so a single refresh failure can be propagated to every caller
/// awaiting the shared in-flight refresh.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// Connection attempt failed before any response arrived
    #[error("Network unreachable")]
    NetworkUnreachable,

    /// No response within the per-call budget
    #[error("Request timed out")]
    Timeout,

    /// Credential rejected and could not be renewed
    #[error("Authentication expired")]
    AuthExpired,

    /// Server answered with a non-2xx status and a body
    #[error("Server rejected request: HTTP {status}: {message}")]
    ServerRejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Retry budget exhausted on an idempotent call
    #[error("Request failed after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: u32, last: Box<ApiError> },

    /// Response body was not the expected JSON
    #[error("Invalid response body: {0}")]
    InvalidBody(String),

    /// Request URL could not be built
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl ApiError {
    /// HTTP status the error carries; 0 when no response was received.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NetworkUnreachable | ApiError::Timeout => 0,
            ApiError::AuthExpired => 401,
            ApiError::ServerRejected { status, .. } => *status,
            ApiError::MaxRetriesExceeded { last, .. } => last.status_code(),
            ApiError::InvalidBody(_) | ApiError::InvalidUrl(_) | ApiError::Client(_) => 0,
        }
    }

    /// Returns true if this error is transient and the call can be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::NetworkUnreachable | ApiError::Timeout)
    }

    /// Classify a transport-level reqwest failure.
    pub(crate) fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::NetworkUnreachable
        }
    }
}

/// Result type alias using ApiError.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient_network_unreachable() {
        assert!(ApiError::NetworkUnreachable.is_transient());
    }

    #[test]
    fn test_is_transient_timeout() {
        assert!(ApiError::Timeout.is_transient());
    }

    #[test]
    fn test_is_not_transient_auth_expired() {
        assert!(!ApiError::AuthExpired.is_transient());
    }

    #[test]
    fn test_is_not_transient_server_rejected() {
        let e = ApiError::ServerRejected {
            status: 422,
            code: None,
            message: "bad input".to_string(),
        };
        assert!(!e.is_transient());
        assert_eq!(e.status_code(), 422);
    }

    #[test]
    fn test_status_code_zero_before_response() {
        assert_eq!(ApiError::NetworkUnreachable.status_code(), 0);
        assert_eq!(ApiError::Timeout.status_code(), 0);
    }

    #[test]
    fn test_max_retries_carries_last_status() {
        let e = ApiError::MaxRetriesExceeded {
            attempts: 3,
            last: Box::new(ApiError::Timeout),
        };
        assert_eq!(e.status_code(), 0);
        assert!(!e.is_transient());
    }
}
