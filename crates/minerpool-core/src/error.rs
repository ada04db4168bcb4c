//! User-visible error taxonomy for pool operations.

use minerpool_provider::ProviderError;
use minerpool_state::{StorageError, VmId};

use crate::registry::RegistryError;

/// Errors surfaced by the pool. Scoring never fails and has no variant here.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider could not create a machine. Not retried.
    #[error("provisioning failed: {0}")]
    ProvisionFailure(String),

    /// VM could not be reached, or the remote command timed out. Callers may retry.
    #[error("vm {vm_id} unreachable: {reason}")]
    TransportFailure { vm_id: VmId, reason: String },

    /// Remote build or run exited non-zero.
    #[error("deployment on vm {vm_id} exited with {exit_code}")]
    DeploymentFailure {
        vm_id: VmId,
        exit_code: i32,
        output: String,
    },

    /// Provider refused the delete; the ledger entry is kept.
    #[error("termination of vm {vm_id} failed: {reason}")]
    TerminationFailure { vm_id: VmId, reason: String },

    /// Another call is terminating this VM; it cannot be released or claimed.
    #[error("vm {0} is being terminated")]
    TerminationPending(VmId),

    /// The VM was deleted and dropped from the ledger, but the registry did
    /// not confirm the termination record. Do not retry the termination.
    #[error("vm {vm_id} terminated but not recorded: {reason}")]
    TerminationUnrecorded { vm_id: VmId, reason: String },

    #[error("vm not found: {0}")]
    VmNotFound(VmId),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl PoolError {
    pub(crate) fn transport(vm_id: &VmId, err: ProviderError) -> Self {
        PoolError::TransportFailure {
            vm_id: vm_id.clone(),
            reason: err.to_string(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::TransportFailure { .. })
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_failure_display_carries_exit_code() {
        let err = PoolError::DeploymentFailure {
            vm_id: VmId::new("vm-1"),
            exit_code: 2,
            output: "no such file".to_string(),
        };
        assert_eq!(err.to_string(), "deployment on vm vm-1 exited with 2");
        assert!(!err.is_retryable());
    }

    #[test]
    fn transport_is_retryable() {
        let err = PoolError::transport(
            &VmId::new("vm-1"),
            ProviderError::Timeout {
                host: "10.0.0.1".into(),
                limit_secs: 90,
            },
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out after 90s"));
    }

    #[test]
    fn unrecorded_termination_says_vm_is_gone() {
        let err = PoolError::TerminationUnrecorded {
            vm_id: VmId::new("vm-1"),
            reason: "registry offline".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "vm vm-1 terminated but not recorded: registry offline"
        );
        assert!(!err.is_retryable());
    }
}
