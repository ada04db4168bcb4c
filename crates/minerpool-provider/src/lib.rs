//! Minerpool-Provider: VM provider client and remote shell
//!
//! Everything the pool needs from outside the process to manage a machine.
//!
//! ## Layer 1 - Infrastructure
//!
//! Focus: bounded network calls and honest failure classification.
//!
//! ## Key Components
//!
//! - `VmProvider`: async trait for create/list/update/delete plus exec/upload
//! - `RestVmProvider`: `/vms/v3` REST client with remote commands over `ssh`
//! - `SshShell`: time-limited `ssh` invocations with transport detection
//! - `fakes::ScriptedVmProvider`: scripted in-memory provider for tests

pub mod client;
pub mod config;
mod error;
pub mod fakes;
pub mod rest;
pub mod ssh;

pub use client::{CommandOutput, ProvisionedVm, ProviderVm, VmPatch, VmProvider};
pub use config::{ProviderConfig, ProvisionSpec, SshCredentials};
pub use error::ProviderError;
pub use rest::RestVmProvider;
pub use ssh::{remote_path_expr, shell_quote, SshShell};

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;
