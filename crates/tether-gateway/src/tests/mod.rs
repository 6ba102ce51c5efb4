//! Integration tests for the gateway transport.
//!
//! - `harness.rs`    - Mock WebSocket server with scripted per-connection
//!                     behaviors
//! - `connection.rs` - Connection lifecycle: credential handling, heartbeat,
//!                     close-code routing, backoff reconnect
//! - `dispatch.rs`   - Ack tracking, timeouts, retry queue, flush on
//!                     reconnect

mod dispatch;
