//! Error types for the state cache.

use thiserror::Error;

/// Main error type for cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Quota exceeded writing {key}: needs {needed} bytes, capacity is {capacity}")]
    QuotaExceeded {
        key: String,
        needed: usize,
        capacity: usize,
    },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("No backup available for {0}")]
    NoBackup(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Record in collection {collection} has no identity")]
    MissingIdentity { collection: String },

    #[error("Duplicate identity {identity} in collection {collection}")]
    DuplicateIdentity { collection: String, identity: String },

    #[error("Identity {identity} in collection {collection} cannot change")]
    IdentityChanged { collection: String, identity: String },

    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Operation requires confirmation")]
    ConfirmationDeclined,

    #[error("Flush worker has stopped")]
    WorkerStopped,
}

impl CacheError {
    /// True for failures of the storage medium itself rather than of the data.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            CacheError::Io(_)
                | CacheError::QuotaExceeded { .. }
                | CacheError::Unavailable(_)
                | CacheError::Locked
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CacheError::Deserialization(e.to_string())
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
