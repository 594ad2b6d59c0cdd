//! Error types for the revoking store.

use thiserror::Error;

/// Main error type for engine operations.
///
/// A key that is absent through the whole chain is not an error: lookups
/// return `Ok(None)` for it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing store failure during root access, checkpointing or solidify.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store not registered: {0}")]
    StoreNotRegistered(String),

    /// Stored bytes failed verification (checksum or framing).
    #[error("Corrupt data in store {store}: {reason}")]
    Corrupt { store: String, reason: String },

    /// An internal chain invariant would break. Fatal to the current block.
    #[error("Chain consistency violation: {0}")]
    ChainConsistencyViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Data directory is locked by another process")]
    Locked,

    /// A call that no engine state could satisfy, such as marking `HEAD`.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Background worker stopped")]
    WorkerStopped,
}

impl StoreError {
    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        StoreError::ChainConsistencyViolation(msg.into())
    }

    /// True for errors that leave the chain set unusable until `reset`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::ChainConsistencyViolation(_) | StoreError::Corrupt { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;
