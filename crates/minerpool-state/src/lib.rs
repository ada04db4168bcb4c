//! Minerpool-State: Deployment Ledger for the miner VM pool
//!
//! This crate owns the durable record of every VM the pool knows about:
//! who owns it, whether it is free, and where it can be reached.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: record invariants and whole-record writes.
//!
//! ## Key Components
//!
//! - `VmRecord`: one VM, its status and its owner
//! - `DeploymentLedger`: async storage trait for VM records
//! - `JsonFileLedger`: whole-document JSON file, rewritten atomically
//! - `SurrealDeploymentLedger`: SurrealDB-backed transactional store
//! - `fakes::MemoryDeploymentLedger`: in-memory ledger for tests

mod error;
pub mod fakes;
pub mod json_ledger;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_ledger;

pub use error::StorageError;
pub use json_ledger::JsonFileLedger;
pub use schema::{OpenPort, Protocol, VmId, VmRecord, VmStatus};
pub use storage_traits::{DeploymentLedger, StorageResult};
pub use surreal_ledger::{CloudConfig, SurrealDeploymentLedger};
