//! Error types for minerpool-state

use thiserror::Error;

/// Errors that can occur in the deployment ledger
#[derive(Error, Debug)]
pub enum StorageError {
    /// A record would break the status/owner invariant
    #[error("invariant violated for vm {vm_id}: {reason}")]
    InvariantViolation { vm_id: String, reason: String },

    /// Backend connection error
    #[error("ledger connection failed: {0}")]
    Connection(String),

    /// Backend query or write error
    #[error("ledger backend error: {0}")]
    Backend(String),

    /// The persisted document could not be parsed
    #[error("ledger document is corrupt: {0}")]
    Corrupt(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
