//! Gateway transport for the tether client.
//!
//! Two layers live here:
//!
//! - [`GatewayClient`]: one persistent WebSocket connection with a
//!   reconnection/heartbeat state machine and auth-aware close handling
//! - [`MessageDispatcher`]: ack-tracked outbound delivery with a bounded
//!   retry queue on top of the client

mod client;
mod dispatcher;
mod envelope;
mod error;

#[cfg(test)]
mod tests;

pub use client::{
    is_auth_close_code, reconnect_delay_ms, ConnectionState, GatewayClient, GatewayConfig,
    GatewayEvent,
};
pub use dispatcher::{DispatchEvent, DispatcherConfig, MessageDispatcher, QueuedMessage};
pub use envelope::{Envelope, HEARTBEAT_EVENT, SYSTEM_NAMESPACE};
pub use error::{GatewayError, GatewayResult};
