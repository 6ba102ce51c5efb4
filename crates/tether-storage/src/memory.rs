//! In-memory storage backend.

use crate::{KvStorage, StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-process key-value storage.
///
/// Nothing survives a restart; intended for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStorage for MemoryStorage {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| StorageError::Backend("Storage lock poisoned".to_string()))?;
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let data = self
            .data
            .lock()
            .map_err(|_| StorageError::Backend("Storage lock poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| StorageError::Backend("Storage lock poisoned".to_string()))?;
        Ok(data.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let storage = MemoryStorage::new();
        storage.set("key", "value").unwrap();
        assert_eq!(storage.get("key").unwrap(), Some("value".to_string()));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_overwrites() {
        let storage = MemoryStorage::new();
        storage.set("key", "one").unwrap();
        storage.set("key", "two").unwrap();
        assert_eq!(storage.get("key").unwrap(), Some("two".to_string()));
    }

    #[test]
    fn test_delete() {
        let storage = MemoryStorage::new();
        storage.set("key", "value").unwrap();
        assert!(storage.delete("key").unwrap());
        assert!(!storage.delete("key").unwrap());
        assert_eq!(storage.get("key").unwrap(), None);
    }

    #[test]
    fn test_has() {
        let storage = MemoryStorage::new();
        assert!(!storage.has("key").unwrap());
        storage.set("key", "value").unwrap();
        assert!(storage.has("key").unwrap());
    }
}
