//! Configuration for the tether reliability layer.
//!
//! Every tunable consumed by the gateway, dispatcher, offline queue and API
//! client lives here; none of the component algorithms hard-code them.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default gateway (WebSocket) URL.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.tether.sh/ws";

/// Default API (HTTP) base URL.
pub const DEFAULT_API_URL: &str = "https://api.tether.sh";

/// Main tether configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Gateway WebSocket URL.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// API base URL for request/response calls.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Path of the credential refresh endpoint, relative to `api_url`.
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    /// Path of the CSRF token endpoint, relative to `api_url`.
    #[serde(default = "default_csrf_path")]
    pub csrf_path: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Base reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Maximum reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Maximum reconnect attempts before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// How long to wait for a message acknowledgment, in milliseconds.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Retry budget for unacknowledged outbound messages.
    #[serde(default = "default_message_max_retries")]
    pub message_max_retries: u32,
    /// Retry budget for queued offline actions.
    #[serde(default = "default_action_max_retries")]
    pub action_max_retries: u32,
    /// Delay before replaying transiently failed actions, in milliseconds.
    #[serde(default = "default_action_retry_delay_ms")]
    pub action_retry_delay_ms: u64,
    /// Default retry attempts for idempotent API calls.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay between API retries, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_refresh_path() -> String {
    "/auth/refresh".to_string()
}

fn default_csrf_path() -> String {
    "/auth/csrf".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    3_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_message_max_retries() -> u32 {
    3
}

fn default_action_max_retries() -> u32 {
    3
}

fn default_action_retry_delay_ms() -> u64 {
    1_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            gateway_url: default_gateway_url(),
            api_url: default_api_url(),
            refresh_path: default_refresh_path(),
            csrf_path: default_csrf_path(),
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ack_timeout_ms: default_ack_timeout_ms(),
            message_max_retries: default_message_max_retries(),
            action_max_retries: default_action_max_retries(),
            action_retry_delay_ms: default_action_retry_delay_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("TETHER_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(gateway_url) = std::env::var("TETHER_GATEWAY_URL") {
            self.gateway_url = gateway_url;
        }
        if let Ok(api_url) = std::env::var("TETHER_API_URL") {
            self.api_url = api_url;
        }
    }

    /// Get the gateway URL as a parsed URL.
    pub fn gateway_url(&self) -> CoreResult<Url> {
        Url::parse(&self.gateway_url).map_err(CoreError::from)
    }

    /// Get the API base URL as a parsed URL.
    pub fn api_url(&self) -> CoreResult<Url> {
        Url::parse(&self.api_url).map_err(CoreError::from)
    }
}
