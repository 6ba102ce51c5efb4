//! Durable key-value storage for the tether client.
//!
//! The offline action queue persists through this contract; everything else
//! in tether treats storage as a black box. Two backends are provided:
//!
//! - [`FileStorage`]: one file per key under a base directory, written
//!   atomically (temp file + rename)
//! - [`MemoryStorage`]: in-process map, used in tests and ephemeral sessions

mod file;
mod keys;
mod memory;
mod traits;

pub use file::FileStorage;
pub use keys::StorageKeys;
pub use memory::MemoryStorage;
pub use traits::KvStorage;

use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific storage error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
