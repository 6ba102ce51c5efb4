//! Wire envelope for gateway messages.

use serde::{Deserialize, Serialize};

/// Namespace used for connection-level traffic (heartbeats).
pub const SYSTEM_NAMESPACE: &str = "system";

/// Event name for heartbeat envelopes.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// A message sent to/from the gateway.
///
/// An inbound envelope whose `id` matches a pending outbound id is the
/// acknowledgment for that message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique message id.
    pub id: String,
    /// Logical namespace (e.g. "chat", "presence").
    pub namespace: String,
    /// Event name within the namespace.
    pub event: String,
    /// Opaque payload; the gateway never interprets it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: i64,
    /// Correlation id linking related messages.
    pub correlation_id: String,
}

impl Envelope {
    /// Create a new envelope with a fresh id.
    pub fn new(namespace: &str, event: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            namespace: namespace.to_string(),
            event: event.to_string(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Create a heartbeat envelope.
    pub fn heartbeat() -> Self {
        Self::new(SYSTEM_NAMESPACE, HEARTBEAT_EVENT, None)
    }

    /// Returns true for connection-liveness heartbeats.
    pub fn is_heartbeat(&self) -> bool {
        self.namespace == SYSTEM_NAMESPACE && self.event == HEARTBEAT_EVENT
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
