//! Core types, configuration, and utilities for the tether client.

mod config;
mod error;
pub mod logging;
mod paths;

pub use config::{Config, DEFAULT_API_URL, DEFAULT_GATEWAY_URL, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_with_config, LogConfig};
pub use paths::Paths;
