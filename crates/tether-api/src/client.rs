//! Request/response client with automatic credential lifecycle management.
//!
//! Every call carries the in-memory access token; a 401 triggers a silent
//! credential refresh followed by exactly one retry of the original call.
//! Refresh itself is single-flight: concurrent callers that hit an expired
//! credential all await the same in-flight operation instead of racing to
//! overwrite the token.

use crate::credentials::{CsrfResponse, RefreshResponse};
use crate::{ApiError, ApiResult, CredentialEvent, Credentials, RetryPolicy};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

/// How the refresh credential travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// Refresh token held in memory and sent in the refresh request body.
    Bearer,
    /// Refresh token carried by the HTTP cookie store; never visible here.
    Cookie,
}

/// Api client configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL all request paths are joined against.
    pub base_url: Url,
    /// Path of the credential refresh endpoint.
    pub refresh_path: String,
    /// Path of the anti-forgery token endpoint.
    pub csrf_path: String,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Default retry policy for idempotent calls.
    pub retry: RetryPolicy,
    /// Refresh credential transport mode.
    pub mode: CredentialMode,
}

impl ApiConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            refresh_path: "/auth/refresh".to_string(),
            csrf_path: "/auth/csrf".to_string(),
            timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            mode: CredentialMode::Bearer,
        }
    }
}

/// A single request/response call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Opt a non-idempotent method into transparent retry.
    pub idempotent: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            body: None,
            idempotent: false,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

type RefreshFuture = Shared<BoxFuture<'static, ApiResult<()>>>;

/// HTTP client holding volatile credentials.
#[derive(Clone)]
pub struct ApiClient {
    config: ApiConfig,
    http: reqwest::Client,
    credentials: Arc<RwLock<Credentials>>,
    /// Single-flight slot: present while a refresh is in flight.
    refresh_inflight: Arc<Mutex<Option<RefreshFuture>>>,
    event_tx: broadcast::Sender<CredentialEvent>,
}

impl ApiClient {
    /// Create a client. The cookie store backs cookie-mode refresh tokens.
    pub fn new(config: ApiConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            http,
            credentials: Arc::new(RwLock::new(Credentials::default())),
            refresh_inflight: Arc::new(Mutex::new(None)),
            event_tx,
        })
    }

    /// Subscribe to credential lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.event_tx.subscribe()
    }

    /// Replace the held credential set wholesale.
    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().unwrap() = credentials;
    }

    /// Snapshot of the current access token.
    pub fn access_token(&self) -> Option<String> {
        self.credentials.read().unwrap().access_token.clone()
    }

    /// GET a resource.
    pub async fn get(&self, path: &str) -> ApiResult<Value> {
        self.request(ApiRequest::new(Method::GET, path)).await
    }

    /// POST a resource. Never auto-retried.
    pub async fn post(&self, path: &str, body: Value) -> ApiResult<Value> {
        self.request(ApiRequest::new(Method::POST, path).with_body(body))
            .await
    }

    /// PUT a resource.
    pub async fn put(&self, path: &str, body: Value) -> ApiResult<Value> {
        self.request(ApiRequest::new(Method::PUT, path).with_body(body))
            .await
    }

    /// DELETE a resource.
    pub async fn delete(&self, path: &str) -> ApiResult<Value> {
        self.request(ApiRequest::new(Method::DELETE, path)).await
    }

    /// PATCH a resource. Never auto-retried.
    pub async fn patch(&self, path: &str, body: Value) -> ApiResult<Value> {
        self.request(ApiRequest::new(Method::PATCH, path).with_body(body))
            .await
    }

    /// Perform a call with credential handling and transient-failure retry.
    ///
    /// Idempotent methods (GET, PUT, DELETE) retry transient failures per
    /// the configured policy; POST and PATCH run once unless the request
    /// opts in, since a repeat might duplicate a side effect.
    pub async fn request(&self, req: ApiRequest) -> ApiResult<Value> {
        let retryable = req.idempotent
            || matches!(req.method, Method::GET | Method::PUT | Method::DELETE);
        let attempts = if retryable {
            self.config.retry.attempts.max(1)
        } else {
            1
        };

        let mut last: Option<ApiError> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry.delay_for_attempt(attempt - 1);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    path = %req.path,
                    "Transient failure, retrying request"
                );
                sleep(delay).await;
            }

            match self.execute(&req, true).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retryable => {
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let last = last.unwrap_or(ApiError::NetworkUnreachable);
        warn!(path = %req.path, attempts, error = %last, "Retry budget exhausted");
        Err(ApiError::MaxRetriesExceeded {
            attempts,
            last: Box::new(last),
        })
    }

    /// One attempt of one call. Handles a 401 by refreshing the credential
    /// and retrying once; a second 401 is terminal.
    async fn execute(&self, req: &ApiRequest, allow_refresh: bool) -> ApiResult<Value> {
        let url = self
            .config
            .base_url
            .join(&req.path)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        let mut builder = self
            .http
            .request(req.method.clone(), url)
            .timeout(Duration::from_millis(self.config.timeout_ms));

        if let Some(token) = self.access_token() {
            builder = builder.bearer_auth(token);
        }
        if Self::is_state_changing(&req.method) {
            if let Some(csrf) = self.ensure_csrf_token().await {
                builder = builder.header("X-CSRF-Token", csrf);
            }
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ApiError::from_transport)?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            if !allow_refresh {
                warn!(path = %req.path, "Still unauthorized after refresh");
                return Err(ApiError::AuthExpired);
            }
            debug!(path = %req.path, "Unauthorized; refreshing credential and retrying once");
            self.refresh_credential().await.map_err(|e| {
                warn!(error = %e, "Credential refresh failed");
                ApiError::AuthExpired
            })?;
            return Box::pin(self.execute(req, false)).await;
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::rejection(status.as_u16(), body));
        }

        let text = response.text().await.map_err(ApiError::from_transport)?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::InvalidBody(e.to_string()))
    }

    /// Renew the access token, coalescing concurrent callers onto one
    /// in-flight operation.
    pub async fn refresh_credential(&self) -> ApiResult<()> {
        let fut = {
            let mut slot = self.refresh_inflight.lock().unwrap();
            if let Some(existing) = slot.as_ref() {
                debug!("Refresh already in flight; awaiting existing operation");
                existing.clone()
            } else {
                let client = self.clone();
                let fut: RefreshFuture = async move {
                    let result = client.do_refresh().await;
                    *client.refresh_inflight.lock().unwrap() = None;
                    result
                }
                .boxed()
                .shared();
                *slot = Some(fut.clone());
                fut
            }
        };
        fut.await
    }

    /// The actual refresh round-trip. Success replaces the access token
    /// wholesale; failure clears every credential.
    async fn do_refresh(&self) -> ApiResult<()> {
        let url = self
            .config
            .base_url
            .join(&self.config.refresh_path)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        let mut body = serde_json::Map::new();
        if self.config.mode == CredentialMode::Bearer {
            let refresh_token = self.credentials.read().unwrap().refresh_token.clone();
            if let Some(token) = refresh_token {
                body.insert("refreshToken".to_string(), Value::String(token));
            }
        }

        let result = self
            .http
            .post(url)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .json(&Value::Object(body))
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.clear_credentials();
                return Err(ApiError::from_transport(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Credential refresh rejected");
            self.clear_credentials();
            return Err(Self::rejection(status.as_u16(), body));
        }

        let data: RefreshResponse = match response.json().await {
            Ok(d) => d,
            Err(e) => {
                self.clear_credentials();
                return Err(ApiError::InvalidBody(e.to_string()));
            }
        };

        {
            let mut credentials = self.credentials.write().unwrap();
            credentials.access_token = Some(data.access_token);
            if let Some(token) = data.refresh_token {
                credentials.refresh_token = Some(token);
            }
            if let Some(token) = data.csrf_token {
                credentials.csrf_token = Some(token);
            }
        }

        info!("Credential refreshed");
        let _ = self.event_tx.send(CredentialEvent::Refreshed);
        Ok(())
    }

    /// Drop every held credential and announce the terminal failure.
    fn clear_credentials(&self) {
        *self.credentials.write().unwrap() = Credentials::default();
        warn!("Credentials cleared after refresh failure");
        let _ = self.event_tx.send(CredentialEvent::Cleared);
    }

    /// Return the cached anti-forgery token, fetching it once if absent.
    ///
    /// A fetch failure is tolerated: the call proceeds without the header
    /// and the server decides whether to accept it.
    async fn ensure_csrf_token(&self) -> Option<String> {
        if let Some(token) = self.credentials.read().unwrap().csrf_token.clone() {
            return Some(token);
        }

        let url = match self.config.base_url.join(&self.config.csrf_path) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "Invalid anti-forgery endpoint");
                return None;
            }
        };

        let mut builder = self
            .http
            .get(url)
            .timeout(Duration::from_millis(self.config.timeout_ms));
        if let Some(token) = self.access_token() {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Anti-forgery token fetch failed; proceeding without");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                status = response.status().as_u16(),
                "Anti-forgery token fetch rejected; proceeding without"
            );
            return None;
        }

        match response.json::<CsrfResponse>().await {
            Ok(data) => {
                self.credentials.write().unwrap().csrf_token = Some(data.csrf_token.clone());
                Some(data.csrf_token)
            }
            Err(e) => {
                warn!(error = %e, "Invalid anti-forgery response; proceeding without");
                None
            }
        }
    }

    fn is_state_changing(method: &Method) -> bool {
        !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// Wrap a non-2xx response, lifting `code`/`message` out of JSON bodies.
    fn rejection(status: u16, body: String) -> ApiError {
        #[derive(Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            code: Option<String>,
            #[serde(default)]
            message: Option<String>,
            #[serde(default)]
            error: Option<String>,
        }

        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => {
                let message = parsed.message.or(parsed.error).unwrap_or_else(|| body.clone());
                ApiError::ServerRejected {
                    status,
                    code: parsed.code,
                    message,
                }
            }
            Err(_) => ApiError::ServerRejected {
                status,
                code: None,
                message: body,
            },
        }
    }
}
