//! Pool facade
//!
//! Wires allocation, orchestration, scoring and the registry into the
//! operations the CLI exposes. Registry writes are optional: without a
//! registry the facade behaves the same minus the publishing.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use minerpool_provider::{CommandOutput, VmPatch};
use minerpool_state::{OpenPort, VmId, VmRecord};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocation::AllocationManager;
use crate::config::RegistryConfig;
use crate::error::{PoolError, Result};
use crate::orchestrator::{ContainerOrchestrator, WorkloadSource};
use crate::registry::{publish_confirmed, publish_detached, RegistryBridge};
use crate::scoreboard::Scoreboard;
use crate::scoring::{Candidate, CandidateScore, ScoringEngine};

/// A batch of candidate answers to one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub question: String,
    pub truth: String,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub batch_id: Uuid,
    pub scores: Vec<CandidateScore>,
}

struct RegistryLink {
    bridge: Arc<dyn RegistryBridge>,
    topics: RegistryConfig,
}

pub struct Pool {
    allocator: AllocationManager,
    orchestrator: ContainerOrchestrator,
    scoring: ScoringEngine,
    registry: Option<RegistryLink>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(
        allocator: AllocationManager,
        orchestrator: ContainerOrchestrator,
        scoring: ScoringEngine,
    ) -> Self {
        Self {
            allocator,
            orchestrator,
            scoring,
            registry: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Publish lifecycle records and score batches to `bridge`.
    pub fn with_registry(mut self, bridge: Arc<dyn RegistryBridge>, topics: RegistryConfig) -> Self {
        self.registry = Some(RegistryLink { bridge, topics });
        self
    }

    pub fn allocator(&self) -> &AllocationManager {
        &self.allocator
    }

    pub fn orchestrator(&self) -> &ContainerOrchestrator {
        &self.orchestrator
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    /// Bind a VM to `owner` and record the binding in the registry.
    ///
    /// When the registry refuses the record, the claim is rolled back and
    /// the registry error returned.
    pub async fn allocate(&self, owner: &str, instance_name: &str) -> Result<VmRecord> {
        let record = self.allocator.allocate(owner, instance_name).await?;
        let Some(link) = &self.registry else {
            return Ok(record);
        };

        let payload = json!({
            "type": "vm_allocated",
            "vmId": record.vm_id,
            "ownerAddress": record.owner_address,
            "instanceName": record.instance_name,
            "at": Utc::now().to_rfc3339(),
        });
        if let Err(e) = publish_confirmed(link.bridge.as_ref(), &link.topics.allocation_topic, &payload).await {
            warn!(vm_id = %record.vm_id, error = %e, "allocation not recorded, rolling back");
            self.allocator.release(&record.vm_id).await?;
            return Err(e.into());
        }
        Ok(record)
    }

    pub async fn release(&self, vm_id: &VmId) -> Result<Option<VmRecord>> {
        self.allocator.release(vm_id).await
    }

    /// Delete the VM and record the termination. Unknown VMs are a no-op.
    ///
    /// If the registry refuses the record, the VM is already gone and
    /// [`PoolError::TerminationUnrecorded`] is returned.
    pub async fn terminate(&self, vm_id: &VmId) -> Result<bool> {
        if !self.allocator.terminate(vm_id).await? {
            return Ok(false);
        }
        if let Some(link) = &self.registry {
            let payload = json!({
                "type": "vm_terminated",
                "vmId": vm_id,
                "at": Utc::now().to_rfc3339(),
            });
            if let Err(e) =
                publish_confirmed(link.bridge.as_ref(), &link.topics.allocation_topic, &payload).await
            {
                warn!(vm_id = %vm_id, error = %e, "termination not recorded");
                return Err(PoolError::TerminationUnrecorded {
                    vm_id: vm_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(true)
    }

    pub async fn list(&self) -> Result<Vec<VmRecord>> {
        self.allocator.list().await
    }

    pub async fn get(&self, vm_id: &VmId) -> Result<Option<VmRecord>> {
        self.allocator.get(vm_id).await
    }

    pub async fn sync(&self) -> Result<usize> {
        self.allocator.sync_from_provider().await
    }

    /// Deploy a workload. `port` defaults to the orchestrator's default port.
    pub async fn deploy(&self, vm_id: &VmId, source: WorkloadSource, port: Option<u16>) -> Result<i32> {
        let port = port.unwrap_or(self.orchestrator.config().default_port);
        self.orchestrator.deploy(vm_id, source, port).await
    }

    /// Stop the workload; on success the VM goes back to the free pool.
    pub async fn stop(&self, vm_id: &VmId, container: Option<&str>) -> Result<i32> {
        let code = self.orchestrator.stop(vm_id, container).await?;
        if let Err(e) = self.allocator.release(vm_id).await {
            warn!(vm_id = %vm_id, error = %e, "container stopped but release failed");
            return Err(e);
        }
        Ok(code)
    }

    /// Open `ports` (TCP) on the VM in addition to those already open.
    pub async fn open_ports(&self, vm_id: &VmId, ports: &[u16]) -> Result<VmRecord> {
        if ports.is_empty() || ports.contains(&0) {
            return Err(PoolError::InvalidRequest(
                "ports must be a non-empty list of non-zero ports".to_string(),
            ));
        }
        if self.allocator.get(vm_id).await?.is_none() {
            return Err(PoolError::VmNotFound(vm_id.clone()));
        }

        let provider = self.allocator.provider();
        let current = provider
            .list()
            .await?
            .into_iter()
            .find(|vm| &vm.vm_id == vm_id)
            .ok_or_else(|| PoolError::VmNotFound(vm_id.clone()))?;

        let mut merged: BTreeSet<OpenPort> = current.ports;
        merged.extend(ports.iter().copied().map(OpenPort::tcp));

        provider
            .update(&[VmPatch {
                id: vm_id.clone(),
                vm_name: None,
                open_ports: Some(merged.iter().copied().collect()),
            }])
            .await?;
        info!(vm_id = %vm_id, ports = merged.len(), "ports updated");
        self.allocator.record_ports(vm_id, merged).await
    }

    pub async fn exec(&self, vm_id: &VmId, command: &str) -> Result<CommandOutput> {
        if command.trim().is_empty() {
            return Err(PoolError::InvalidRequest("command must not be empty".to_string()));
        }
        self.orchestrator.run(vm_id, command).await
    }

    pub async fn upload(&self, vm_id: &VmId, bytes: &[u8], remote_path: &str) -> Result<CommandOutput> {
        if remote_path.trim().is_empty() {
            return Err(PoolError::InvalidRequest("remote path must not be empty".to_string()));
        }
        self.orchestrator.upload(vm_id, bytes, remote_path).await
    }

    pub async fn score(&self, question: &str, truth: &str, candidate: &str) -> u8 {
        self.scoring.score(question, truth, candidate).await
    }

    /// Score a batch and publish the scores in the background.
    pub async fn validate(&self, request: &ValidationRequest) -> ValidationReport {
        let scores = self
            .scoring
            .score_all(&request.question, &request.truth, &request.candidates)
            .await;
        let batch_id = Uuid::new_v4();

        if let Some(link) = &self.registry {
            if !scores.is_empty() {
                let entries: Vec<_> = scores
                    .iter()
                    .map(|s| json!({ "walletId": s.owner_id, "score": s.score }))
                    .collect();
                let payload = json!({
                    "type": "scores",
                    "batchId": batch_id,
                    "question": request.question,
                    "scores": entries,
                    "at": Utc::now().to_rfc3339(),
                });
                let handle =
                    publish_detached(link.bridge.clone(), link.topics.score_topic.clone(), payload);
                self.track(handle);
            }
        }

        ValidationReport { batch_id, scores }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }

    /// Wait for background publishes started by [`Pool::validate`], at most
    /// the registry request timeout. Returns `false` if some were still
    /// running when the wait ran out; those are aborted.
    pub async fn flush_publications(&self) -> bool {
        let handles: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return true,
        };
        if handles.is_empty() {
            return true;
        }
        let limit = self
            .registry
            .as_ref()
            .map(|link| link.topics.request_timeout)
            .unwrap_or_default();

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(limit, futures::future::join_all(handles)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    pending = aborts.len(),
                    limit_secs = limit.as_secs(),
                    "score publishes still running, dropping them"
                );
                aborts.iter().for_each(|a| a.abort());
                false
            }
        }
    }

    /// Scoreboard over the configured score topic, when a registry is set.
    pub fn scoreboard(&self) -> Option<Scoreboard> {
        self.registry
            .as_ref()
            .map(|link| Scoreboard::new(link.bridge.clone(), &link.topics.score_topic))
    }
}
