//! Pending action records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for the next sync pass.
    Pending,
    /// Currently being executed.
    Syncing,
    /// Retry budget exhausted; retained until explicit retry or clear.
    Failed,
}

/// A user-initiated mutation awaiting delivery.
///
/// Persisted as part of a JSON array under a fixed storage key on every
/// mutation. Completed actions are deleted rather than retained, so
/// `ActionStatus` has no completed variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    /// Unique action id.
    pub id: String,
    /// Application-defined action type, dispatched to the injected handler.
    pub action_type: String,
    /// Opaque payload; the queue never interprets it.
    pub payload: serde_json::Value,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Failed execution attempts so far.
    pub retries: u32,
    /// Retry budget; at the limit the action turns failed.
    pub max_retries: u32,
    /// Current lifecycle status.
    pub status: ActionStatus,
    /// Correlation id linking the action to related traffic.
    pub correlation_id: String,
    /// Last execution error, recorded when the action fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PendingAction {
    /// Create a new pending action.
    pub fn new(action_type: &str, payload: serde_json::Value, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.to_string(),
            payload,
            created_at: Utc::now(),
            retries: 0,
            max_retries,
            status: ActionStatus::Pending,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            error: None,
        }
    }
}
