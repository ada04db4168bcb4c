//! Container orchestration on allocated VMs.
//!
//! One workload container per VM: every deploy removes the previous
//! container of the same name before starting the new one.

use std::sync::Arc;
use std::time::Instant;

use minerpool_provider::{CommandOutput, SshCredentials, VmProvider};
use minerpool_state::VmId;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::docker;
use crate::error::{PoolError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Where the workload's Dockerfile comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadSource {
    /// Fetched by the VM itself.
    Url(String),
    /// Uploaded from here before the build.
    File(Vec<u8>),
}

impl WorkloadSource {
    fn kind(&self) -> &'static str {
        match self {
            WorkloadSource::Url(_) => "url",
            WorkloadSource::File(_) => "file",
        }
    }
}

pub struct ContainerOrchestrator {
    provider: Arc<dyn VmProvider>,
    credentials: SshCredentials,
    config: OrchestratorConfig,
}

impl ContainerOrchestrator {
    pub fn new(
        provider: Arc<dyn VmProvider>,
        credentials: SshCredentials,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            credentials,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn credentials(&self) -> &SshCredentials {
        &self.credentials
    }

    /// Build and start the workload on `vm_id`, bound to `port`.
    ///
    /// Returns the remote exit code, which is always 0 on `Ok`.
    #[tracing::instrument(skip_all, fields(vm_id = %vm_id))]
    pub async fn deploy(&self, vm_id: &VmId, source: WorkloadSource, port: u16) -> Result<i32> {
        if port == 0 {
            return Err(PoolError::InvalidRequest("port must be non-zero".to_string()));
        }
        let started = Instant::now();
        let kind = source.kind();

        let script = match source {
            WorkloadSource::Url(url) => {
                let url = url.trim();
                if url.is_empty() {
                    return Err(PoolError::InvalidRequest(
                        "dockerfile url must not be empty".to_string(),
                    ));
                }
                docker::setup_from_url(&self.config, url, port)
            }
            WorkloadSource::File(bytes) => {
                self.upload_dockerfile(vm_id, bytes).await?;
                docker::setup_from_uploaded(&self.config, port)
            }
        };

        debug!(source = kind, port, "running container setup");
        let output = self.run(vm_id, &script).await?;
        if !output.success() {
            return Err(PoolError::DeploymentFailure {
                vm_id: vm_id.clone(),
                exit_code: output.exit_code,
                output: output.combined(),
            });
        }

        METRICS.inc_deployments();
        obs::emit_workload_deployed(
            vm_id.as_str(),
            kind,
            port,
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        Ok(output.exit_code)
    }

    async fn upload_dockerfile(&self, vm_id: &VmId, bytes: Vec<u8>) -> Result<()> {
        if !docker::looks_like_dockerfile(&bytes) {
            return Err(PoolError::InvalidRequest(
                "uploaded file does not look like a Dockerfile".to_string(),
            ));
        }
        let bytes = match &self.config.github_token {
            Some(token) => match String::from_utf8(bytes) {
                Ok(text) => docker::inject_github_token(&text, token).into_bytes(),
                Err(e) => e.into_bytes(),
            },
            None => bytes,
        };

        let remote_path = self.config.remote_dockerfile();
        let output = self
            .provider
            .upload(vm_id, &bytes, &remote_path, &self.credentials)
            .await
            .map_err(|e| PoolError::transport(vm_id, e))?;
        if !output.success() {
            return Err(PoolError::DeploymentFailure {
                vm_id: vm_id.clone(),
                exit_code: output.exit_code,
                output: format!("upload to {remote_path} failed: {}", output.combined()),
            });
        }
        Ok(())
    }

    /// Stop and remove the workload container. A container that does not
    /// exist counts as stopped.
    pub async fn stop(&self, vm_id: &VmId, container: Option<&str>) -> Result<i32> {
        let container = container
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(self.config.container_name.as_str());

        let output = self.run(vm_id, &docker::stop_command(container)).await?;
        if !output.success() && !docker::is_missing_container(&output.combined()) {
            return Err(PoolError::DeploymentFailure {
                vm_id: vm_id.clone(),
                exit_code: output.exit_code,
                output: output.combined(),
            });
        }
        obs::emit_workload_stopped(vm_id.as_str(), container);
        Ok(0)
    }

    /// Run an arbitrary command; a non-zero exit is returned, not raised.
    pub async fn run(&self, vm_id: &VmId, command: &str) -> Result<CommandOutput> {
        self.provider
            .exec(vm_id, command, &self.credentials)
            .await
            .map_err(|e| PoolError::transport(vm_id, e))
    }

    /// Write raw bytes to `remote_path` on the VM.
    pub async fn upload(&self, vm_id: &VmId, bytes: &[u8], remote_path: &str) -> Result<CommandOutput> {
        self.provider
            .upload(vm_id, bytes, remote_path, &self.credentials)
            .await
            .map_err(|e| PoolError::transport(vm_id, e))
    }
}
