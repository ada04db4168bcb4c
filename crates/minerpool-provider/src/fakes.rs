//! Scripted in-memory provider (testing only)
//!
//! `ScriptedVmProvider` hands out sequential VM ids, records every command
//! and upload, and replies according to simple substring rules so tests can
//! script build failures, unreachable hosts and slow provisioning.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use minerpool_state::VmId;

use crate::client::{CommandOutput, ProvisionedVm, ProviderVm, VmPatch, VmProvider};
use crate::config::{ProvisionSpec, SshCredentials};
use crate::error::ProviderError;
use crate::Result;

/// Canned reply for a remote command.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Output {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Unreachable(String),
    Timeout,
}

impl ScriptedReply {
    pub fn ok(stdout: &str) -> Self {
        ScriptedReply::Output {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        ScriptedReply::Output {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn resolve(self, host: &str) -> Result<CommandOutput> {
        match self {
            ScriptedReply::Output {
                exit_code,
                stdout,
                stderr,
            } => Ok(CommandOutput {
                exit_code,
                stdout,
                stderr,
                duration_ms: 1,
            }),
            ScriptedReply::Unreachable(reason) => Err(ProviderError::Transport {
                host: host.to_string(),
                reason,
            }),
            ScriptedReply::Timeout => Err(ProviderError::Timeout {
                host: host.to_string(),
                limit_secs: 90,
            }),
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    next_id: u64,
    vms: Vec<ProviderVm>,
    create_error: Option<String>,
    delete_error: Option<String>,
    create_delay: Option<Duration>,
    delete_delay: Option<Duration>,
    rules: Vec<(String, ScriptedReply)>,
    queued: VecDeque<ScriptedReply>,
    unreachable: HashSet<VmId>,
    create_calls: usize,
    created_names: Vec<String>,
    deleted: Vec<VmId>,
    updates: Vec<VmPatch>,
    commands: Vec<(VmId, String)>,
    uploads: Vec<(VmId, String, Vec<u8>)>,
}

/// In-memory `VmProvider` with scripted behaviour.
#[derive(Debug, Default)]
pub struct ScriptedVmProvider {
    state: Mutex<ScriptState>,
}

impl ScriptedVmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every create call fail with `message`.
    pub fn fail_create(&self, message: &str) {
        self.state.lock().unwrap().create_error = Some(message.to_string());
    }

    /// Make every delete call fail with `message`.
    pub fn fail_delete(&self, message: &str) {
        self.state.lock().unwrap().delete_error = Some(message.to_string());
    }

    /// Sleep this long inside each create call.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    /// Sleep this long inside each delete call, before it takes effect.
    pub fn set_delete_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delete_delay = Some(delay);
    }

    /// Commands containing `needle` get `reply`. Earlier rules win.
    pub fn reply_when(&self, needle: &str, reply: ScriptedReply) {
        self.state
            .lock()
            .unwrap()
            .rules
            .push((needle.to_string(), reply));
    }

    /// Reply for the next unmatched command.
    pub fn push_reply(&self, reply: ScriptedReply) {
        self.state.lock().unwrap().queued.push_back(reply);
    }

    /// Every exec or upload against `vm_id` fails as unreachable.
    pub fn set_unreachable(&self, vm_id: &VmId) {
        self.state.lock().unwrap().unreachable.insert(vm_id.clone());
    }

    /// Register a VM the provider already knows about.
    pub fn add_vm(&self, vm: ProviderVm) {
        self.state.lock().unwrap().vms.push(vm);
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn created_names(&self) -> Vec<String> {
        self.state.lock().unwrap().created_names.clone()
    }

    pub fn deleted(&self) -> Vec<VmId> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn updates(&self) -> Vec<VmPatch> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn commands(&self) -> Vec<(VmId, String)> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn uploads(&self) -> Vec<(VmId, String, Vec<u8>)> {
        self.state.lock().unwrap().uploads.clone()
    }

    fn host_for(state: &ScriptState, vm_id: &VmId) -> Result<String> {
        let vm = state
            .vms
            .iter()
            .find(|vm| &vm.vm_id == vm_id)
            .ok_or_else(|| ProviderError::VmNotFound(vm_id.to_string()))?;
        vm.public_ip
            .clone()
            .ok_or_else(|| ProviderError::NoAddress(vm_id.to_string()))
    }

    fn reply_for(state: &mut ScriptState, command: &str) -> ScriptedReply {
        if let Some((_, reply)) = state.rules.iter().find(|(n, _)| command.contains(n)) {
            return reply.clone();
        }
        state
            .queued
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::ok(""))
    }
}

#[async_trait]
impl VmProvider for ScriptedVmProvider {
    async fn create(&self, spec: &ProvisionSpec, name: &str) -> Result<Vec<ProvisionedVm>> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            state.created_names.push(name.to_string());
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.create_error {
            return Err(ProviderError::Api {
                status: 500,
                body: message.clone(),
            });
        }
        let mut out = Vec::new();
        for _ in 0..spec.instances.max(1) {
            state.next_id += 1;
            let n = state.next_id;
            let vm_id = VmId::new(format!("vm-{n}"));
            state.vms.push(ProviderVm {
                vm_id: vm_id.clone(),
                name: Some(name.to_string()),
                status: Some("Launching".to_string()),
                public_ip: Some(format!("10.0.0.{n}")),
                ports: spec.open_ports.iter().cloned().collect(),
            });
            out.push(ProvisionedVm {
                vm_id,
                name: name.to_string(),
            });
        }
        Ok(out)
    }

    async fn list(&self) -> Result<Vec<ProviderVm>> {
        Ok(self.state.lock().unwrap().vms.clone())
    }

    async fn update(&self, patches: &[VmPatch]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for patch in patches {
            let vm = state
                .vms
                .iter_mut()
                .find(|vm| vm.vm_id == patch.id)
                .ok_or_else(|| ProviderError::VmNotFound(patch.id.to_string()))?;
            if let Some(name) = &patch.vm_name {
                vm.name = Some(name.clone());
            }
            if let Some(ports) = &patch.open_ports {
                vm.ports = ports.iter().cloned().collect();
            }
        }
        state.updates.extend(patches.iter().cloned());
        Ok(())
    }

    async fn delete(&self, vm_ids: &[VmId]) -> Result<()> {
        let delay = self.state.lock().unwrap().delete_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.delete_error {
            return Err(ProviderError::Api {
                status: 502,
                body: message.clone(),
            });
        }
        state.vms.retain(|vm| !vm_ids.contains(&vm.vm_id));
        state.deleted.extend(vm_ids.iter().cloned());
        Ok(())
    }

    async fn exec(
        &self,
        vm_id: &VmId,
        command: &str,
        _credentials: &SshCredentials,
    ) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        let host = Self::host_for(&state, vm_id)?;
        state.commands.push((vm_id.clone(), command.to_string()));
        if state.unreachable.contains(vm_id) {
            return ScriptedReply::Unreachable("connection refused".into()).resolve(&host);
        }
        Self::reply_for(&mut state, command).resolve(&host)
    }

    async fn upload(
        &self,
        vm_id: &VmId,
        bytes: &[u8],
        remote_path: &str,
        _credentials: &SshCredentials,
    ) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        let host = Self::host_for(&state, vm_id)?;
        if state.unreachable.contains(vm_id) {
            return ScriptedReply::Unreachable("connection refused".into()).resolve(&host);
        }
        state
            .uploads
            .push((vm_id.clone(), remote_path.to_string(), bytes.to_vec()));
        ScriptedReply::ok("").resolve(&host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_hands_out_sequential_ids() {
        let provider = ScriptedVmProvider::new();
        let spec = ProvisionSpec {
            instances: 2,
            ..ProvisionSpec::default()
        };
        let vms = provider.create(&spec, "miner").await.unwrap();
        assert_eq!(
            vms.iter().map(|v| v.vm_id.as_str()).collect::<Vec<_>>(),
            vec!["vm-1", "vm-2"]
        );
        assert_eq!(provider.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rules_take_priority_over_queue() {
        let provider = ScriptedVmProvider::new();
        let vm = provider
            .create(&ProvisionSpec::default(), "m")
            .await
            .unwrap()
            .remove(0)
            .vm_id;
        let creds = SshCredentials::new("ubuntu", "/k");
        provider.reply_when("docker rm", ScriptedReply::failed(1, "No such container"));
        provider.push_reply(ScriptedReply::ok("queued"));

        let out = provider.exec(&vm, "docker rm -f c", &creds).await.unwrap();
        assert_eq!(out.exit_code, 1);
        let out = provider.exec(&vm, "echo hi", &creds).await.unwrap();
        assert_eq!(out.stdout, "queued");
        assert_eq!(provider.commands().len(), 2);
    }

    #[tokio::test]
    async fn unknown_vm_is_not_found() {
        let provider = ScriptedVmProvider::new();
        let creds = SshCredentials::new("ubuntu", "/k");
        let err = provider
            .exec(&VmId::new("ghost"), "true", &creds)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::VmNotFound(_)));
    }
}
