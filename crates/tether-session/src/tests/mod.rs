//! End-to-end tests for the session coordinator.
//!
//! - `harness.rs` - Mock gateway (WebSocket) and auth server (HTTP) plus
//!                  event-wait helpers
//! - `session.rs` - Wiring rules: connectivity-driven queue, credential
//!                  rejection → renewal → reconnect, terminal teardown

mod session;
