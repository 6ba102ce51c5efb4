//! Storage key constants.

/// Storage keys used by the tether client.
pub struct StorageKeys;

impl StorageKeys {
    /// Offline action queue (JSON array of pending actions)
    pub const OFFLINE_ACTIONS: &'static str = "offline_actions";
}
