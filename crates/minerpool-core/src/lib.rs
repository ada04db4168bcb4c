//! Minerpool Core Library
//!
//! Allocation and lifecycle of pooled inference VMs, workload deployment,
//! response scoring, and registry publishing.
//!
//! ## Layer 2 - Domain
//!
//! - `AllocationManager`: reuse-or-provision allocation over a `DeploymentLedger`
//! - `ContainerOrchestrator`: build/run/stop the workload container over ssh
//! - `ScoringEngine`: judge, numeric and lexical scoring cascade
//! - `RegistryBridge`: confirmed and detached writes to the external registry
//! - `Pool`: facade combining the above

pub mod allocation;
pub mod config;
pub mod docker;
mod error;
mod free_list;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod scoreboard;
pub mod scoring;
pub mod telemetry;

pub use allocation::{AllocationManager, DEFAULT_INSTANCE_NAME};
pub use config::{JudgeConfig, OrchestratorConfig, RegistryConfig};
pub use error::{PoolError, Result};
pub use orchestrator::{ContainerOrchestrator, WorkloadSource};
pub use pool::{Pool, ValidationReport, ValidationRequest};
pub use registry::{
    HttpRegistryBridge, MemoryRegistry, Publication, RegistryBridge, RegistryError, TopicMessage,
};
pub use scoreboard::{owner_averages, Scoreboard};
pub use scoring::{Candidate, CandidateScore, ScoreRequest, ScoreStrategy, ScoringEngine};
pub use telemetry::init_tracing;

pub use minerpool_provider::{
    CommandOutput, ProviderConfig, ProvisionSpec, RestVmProvider, SshCredentials, VmProvider,
};
pub use minerpool_state::{
    DeploymentLedger, JsonFileLedger, OpenPort, SurrealDeploymentLedger, VmId, VmRecord, VmStatus,
};
