//! VM provider trait and wire types
//!
//! `VmProvider` is everything the pool needs from the outside world to
//! manage a machine: lifecycle calls against the provider API plus command
//! execution and file upload over the remote shell.

use std::collections::BTreeSet;

use async_trait::async_trait;
use minerpool_state::{OpenPort, Protocol, VmId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ProvisionSpec, SshCredentials};
use crate::Result;

/// A machine returned by a create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedVm {
    pub vm_id: VmId,
    pub name: String,
}

/// A machine as reported by the provider's list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderVm {
    pub vm_id: VmId,
    pub name: Option<String>,
    pub status: Option<String>,
    pub public_ip: Option<String>,
    pub ports: BTreeSet<OpenPort>,
}

/// Rename / re-port request for one VM. `open_ports` must be the full list;
/// the provider replaces rather than merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmPatch {
    pub id: VmId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_ports: Option<Vec<OpenPort>>,
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (0 = success).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for error reports.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Remote VM provisioning service plus remote shell.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Provision machine(s) named `name`. Returns at least one VM on success.
    async fn create(&self, spec: &ProvisionSpec, name: &str) -> Result<Vec<ProvisionedVm>>;

    /// All machines currently known to the provider.
    async fn list(&self) -> Result<Vec<ProviderVm>>;

    /// Rename or re-port machines.
    async fn update(&self, patches: &[VmPatch]) -> Result<()>;

    /// Delete machines.
    async fn delete(&self, vm_ids: &[VmId]) -> Result<()>;

    /// Run `command` on the VM and capture its output.
    async fn exec(
        &self,
        vm_id: &VmId,
        command: &str,
        credentials: &SshCredentials,
    ) -> Result<CommandOutput>;

    /// Write `bytes` to `remote_path` on the VM, creating parent directories.
    async fn upload(
        &self,
        vm_id: &VmId,
        bytes: &[u8],
        remote_path: &str,
        credentials: &SshCredentials,
    ) -> Result<CommandOutput>;
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn str_field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Pull VM ids out of a create response.
///
/// The provider has returned a bare list, a single object, and wrappers keyed
/// by `vms`, `instances`, `deployment`, `items` or `data`; all are accepted.
pub fn extract_provisioned(value: &Value) -> Vec<ProvisionedVm> {
    let mut out: Vec<ProvisionedVm> = Vec::new();
    let mut add = |obj: &Value| {
        if let Some(id) = str_field(obj, &["id", "vmId", "vm_id"]) {
            if out.iter().any(|v| v.vm_id.as_str() == id) {
                return;
            }
            out.push(ProvisionedVm {
                vm_id: VmId::new(id),
                name: str_field(obj, &["name", "vmName"])
                    .unwrap_or("default-vm")
                    .to_string(),
            });
        }
    };

    match value {
        Value::Array(items) => items.iter().filter(|x| x.is_object()).for_each(&mut add),
        Value::Object(_) => {
            for key in ["vms", "instances", "deployment", "items", "data"] {
                if let Some(Value::Array(items)) = value.get(key) {
                    items.iter().filter(|x| x.is_object()).for_each(&mut add);
                }
            }
            add(value);
        }
        _ => {}
    }
    out
}

fn parse_ports(value: Option<&Value>) -> BTreeSet<OpenPort> {
    let Some(Value::Array(items)) = value else {
        return BTreeSet::new();
    };
    items
        .iter()
        .filter_map(|p| {
            let port = p.get("port").and_then(Value::as_u64)?;
            let port = u16::try_from(port).ok()?;
            let protocol = match str_field(p, &["protocol", "proto"])
                .map(str::to_ascii_lowercase)
                .as_deref()
            {
                Some("udp") => Protocol::Udp,
                _ => Protocol::Tcp,
            };
            Some(OpenPort { port, protocol })
        })
        .collect()
}

/// Parse the provider's list response into [`ProviderVm`]s.
pub fn parse_vm_list(value: &Value) -> Vec<ProviderVm> {
    let items: &[Value] = match value {
        Value::Array(items) => items,
        Value::Object(_) => match ["vms", "items", "data"]
            .iter()
            .find_map(|k| value.get(*k).and_then(Value::as_array))
        {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|obj| {
            let id = str_field(obj, &["id", "vmId", "vm_id"])?;
            Some(ProviderVm {
                vm_id: VmId::new(id),
                name: str_field(obj, &["vmName", "name"]).map(String::from),
                status: str_field(obj, &["status"]).map(String::from),
                public_ip: str_field(obj, &["publicIp", "public_ip", "ip"]).map(String::from),
                ports: parse_ports(obj.get("ports").or_else(|| obj.get("openPorts"))),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_from_bare_list() {
        let vms = extract_provisioned(&json!([{"vmId": "a", "vmName": "n1"}, {"id": "b"}]));
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].name, "n1");
        assert_eq!(vms[1].name, "default-vm");
    }

    #[test]
    fn extract_from_wrapped_object() {
        let vms = extract_provisioned(&json!({"instances": [{"vm_id": "x"}], "status": "ok"}));
        assert_eq!(vms, vec![ProvisionedVm {
            vm_id: VmId::new("x"),
            name: "default-vm".to_string()
        }]);
    }

    #[test]
    fn extract_ignores_garbage() {
        assert!(extract_provisioned(&json!("nope")).is_empty());
        assert!(extract_provisioned(&json!({"message": "queued"})).is_empty());
    }

    #[test]
    fn parse_list_reads_ports_and_address() {
        let vms = parse_vm_list(&json!([{
            "id": "vm-1",
            "vmName": "tnode",
            "status": "Active",
            "publicIp": "203.0.113.5",
            "ports": [{"port": 22, "protocol": "TCP"}, {"port": 53, "proto": "udp"}, {"port": 99999}]
        }]));
        assert_eq!(vms.len(), 1);
        let vm = &vms[0];
        assert_eq!(vm.public_ip.as_deref(), Some("203.0.113.5"));
        assert!(vm.ports.contains(&OpenPort::tcp(22)));
        assert!(vm.ports.contains(&OpenPort {
            port: 53,
            protocol: Protocol::Udp
        }));
        assert_eq!(vm.ports.len(), 2);
    }

    #[test]
    fn command_output_combined() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "building\n".into(),
            stderr: "boom\n".into(),
            duration_ms: 3,
        };
        assert_eq!(out.combined(), "building\nboom");
        assert!(!out.success());
    }

    #[test]
    fn patch_serializes_camel_case_and_skips_none() {
        let patch = VmPatch {
            id: VmId::new("vm-1"),
            vm_name: None,
            open_ports: Some(vec![OpenPort::tcp(80)]),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["id"], "vm-1");
        assert!(json.get("vmName").is_none());
        assert_eq!(json["openPorts"][0]["port"], 80);
    }
}
