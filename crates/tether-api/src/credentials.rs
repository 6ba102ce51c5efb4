//! In-memory credential set.
//!
//! Tokens live in process memory only and are never written to durable
//! storage. The whole set is replaced wholesale on every successful renewal.

use serde::Deserialize;

/// Credential set held by the api client.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Access token attached as `Authorization: Bearer`.
    pub access_token: Option<String>,
    /// Refresh token; absent in cookie mode, where the cookie store carries it.
    pub refresh_token: Option<String>,
    /// Anti-forgery token attached to state-changing calls.
    pub csrf_token: Option<String>,
}

impl Credentials {
    /// Credentials holding only an access token.
    pub fn bearer(access_token: &str) -> Self {
        Self {
            access_token: Some(access_token.to_string()),
            refresh_token: None,
            csrf_token: None,
        }
    }

    /// True when no access token is held.
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none()
    }
}

/// Credential lifecycle events.
#[derive(Debug, Clone)]
pub enum CredentialEvent {
    /// Renewal succeeded; a fresh access token is in place.
    Refreshed,
    /// Renewal failed terminally; all credentials were cleared.
    Cleared,
}

/// Body of a successful refresh response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub csrf_token: Option<String>,
}

/// Body of the anti-forgery token endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CsrfResponse {
    pub csrf_token: String,
}
