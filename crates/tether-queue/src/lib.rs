//! Durable offline action queue.
//!
//! Mutating operations performed while disconnected are persisted here and
//! replayed serially, in order, once connectivity returns. Actions that
//! exhaust their retry budget are retained in a terminal failed state for
//! inspection, explicit retry, or discard.

mod action;
mod error;
mod queue;

pub use action::{ActionStatus, PendingAction};
pub use error::{QueueError, QueueResult};
pub use queue::{ActionHandler, OfflineActionQueue, QueueConfig, QueueEvent};
