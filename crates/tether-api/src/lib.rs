//! Request/response client with credential lifecycle management.
//!
//! Holds the access token in volatile memory, renews it single-flight when
//! it expires, retries idempotent calls on transient network failure, and
//! attaches anti-forgery tokens to state-changing calls.

mod client;
mod credentials;
mod error;
mod retry;

#[cfg(test)]
mod tests;

pub use client::{ApiClient, ApiConfig, ApiRequest, CredentialMode};
pub use credentials::{CredentialEvent, Credentials};
pub use error::{ApiError, ApiResult};
pub use retry::RetryPolicy;
