//! Session composition root for the tether client.
//!
//! Wires the gateway transport, message dispatcher, offline action queue and
//! api client into one session with a single event surface. Credential
//! lifecycle events feed back into the live connection: rejection triggers
//! renewal, renewal triggers reconnection, terminal failure triggers
//! teardown.

mod coordinator;
mod error;

#[cfg(test)]
mod tests;

pub use coordinator::{SessionCoordinator, SessionEvent};
pub use error::{SessionError, SessionResult};
