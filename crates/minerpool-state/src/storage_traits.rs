//! Storage trait definitions for the deployment ledger
//!
//! `DeploymentLedger` is the only shared mutable resource of the pool. It is
//! deliberately small: ordered reads plus whole-record writes. Claim
//! serialization lives one layer up, in the allocation manager.
//!
//! All implementations are async and backend-agnostic. An in-memory fake is
//! provided for testing via the `fakes` module.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{VmId, VmRecord};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable mapping from VM id to record.
///
/// Guarantees:
/// - `list` returns records in insertion order.
/// - `put` replaces a record in place (keeping its position) or appends it.
/// - `put` rejects records that violate [`VmRecord::check_invariants`].
/// - A write is either fully visible or not visible at all.
/// - `remove` of an absent id returns `Ok(false)`.
#[async_trait]
pub trait DeploymentLedger: Send + Sync {
    /// All records, in insertion order.
    async fn list(&self) -> StorageResult<Vec<VmRecord>>;

    /// A single record, if present.
    async fn get(&self, vm_id: &VmId) -> StorageResult<Option<VmRecord>>;

    /// Insert or replace a record.
    async fn put(&self, record: VmRecord) -> StorageResult<()>;

    /// Remove a record. Returns whether it was present.
    async fn remove(&self, vm_id: &VmId) -> StorageResult<bool>;
}
