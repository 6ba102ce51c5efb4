//! Integration tests for the api client.
//!
//! - `harness.rs`  - Mock HTTP server with scripted per-route responses
//! - `requests.rs` - Header handling, error taxonomy, idempotent retry,
//!                   401-refresh-retry flow
//! - `refresh.rs`  - Single-flight renewal and credential replacement
