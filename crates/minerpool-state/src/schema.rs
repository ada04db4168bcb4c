//! Record definitions for the deployment ledger
//!
//! A `VmRecord` is the unit the ledger stores. Field names serialize in
//! camelCase so the JSON document stays compatible with the ledgers written
//! by earlier tooling (`vmId`, `ownerAddress`, `assignedAt`, ...).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Provider-assigned VM identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(pub String);

impl VmId {
    pub fn new(id: impl Into<String>) -> Self {
        VmId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        VmId(s.to_string())
    }
}

/// Lifecycle status of a VM record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Provisioning,
    Active,
    Inactive,
    Terminated,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Provisioning => "provisioning",
            VmStatus::Active => "active",
            VmStatus::Inactive => "inactive",
            VmStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "provisioning" => Ok(VmStatus::Provisioning),
            "active" => Ok(VmStatus::Active),
            "inactive" => Ok(VmStatus::Inactive),
            "terminated" => Ok(VmStatus::Terminated),
            other => Err(StorageError::Corrupt(format!("unknown vm status: {other}"))),
        }
    }
}

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// A port opened on the VM's public interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl OpenPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

/// One VM tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub vm_id: VmId,
    pub status: VmStatus,
    #[serde(default, alias = "minerAddress")]
    pub owner_address: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub public_network_address: Option<String>,
    #[serde(default)]
    pub open_ports: BTreeSet<OpenPort>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
}

impl VmRecord {
    /// A freshly provisioned VM that nobody owns yet.
    pub fn inactive(vm_id: VmId, created_at: DateTime<Utc>) -> Self {
        Self {
            vm_id,
            status: VmStatus::Inactive,
            owner_address: None,
            instance_name: None,
            public_network_address: None,
            open_ports: BTreeSet::new(),
            created_at,
            assigned_at: None,
            released_at: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.status == VmStatus::Inactive
    }

    /// Bind the VM to `owner`. Caller is responsible for holding the claim lock.
    pub fn claim(&mut self, owner: &str, instance_name: &str, now: DateTime<Utc>) {
        self.status = VmStatus::Active;
        self.owner_address = Some(owner.to_string());
        self.instance_name = Some(instance_name.to_string());
        self.assigned_at = Some(now);
    }

    /// Unbind the VM. Returns `false` when the record was not active.
    pub fn release(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != VmStatus::Active {
            return false;
        }
        self.status = VmStatus::Inactive;
        self.owner_address = None;
        self.instance_name = None;
        self.assigned_at = None;
        self.released_at = Some(now);
        true
    }

    /// Validate the status/owner invariant.
    ///
    /// - `active` requires a non-empty owner.
    /// - `inactive` requires no owner.
    pub fn check_invariants(&self) -> Result<(), StorageError> {
        if self.vm_id.0.trim().is_empty() {
            return Err(StorageError::InvariantViolation {
                vm_id: self.vm_id.0.clone(),
                reason: "vm id is empty".to_string(),
            });
        }
        let has_owner = self
            .owner_address
            .as_deref()
            .is_some_and(|o| !o.trim().is_empty());
        match self.status {
            VmStatus::Active if !has_owner => Err(StorageError::InvariantViolation {
                vm_id: self.vm_id.0.clone(),
                reason: "active record has no owner".to_string(),
            }),
            VmStatus::Inactive if self.owner_address.is_some() => {
                Err(StorageError::InvariantViolation {
                    vm_id: self.vm_id.0.clone(),
                    reason: "inactive record still has an owner".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> VmRecord {
        VmRecord::inactive(VmId::from("vm-1"), Utc::now())
    }

    #[test]
    fn claim_then_release_restores_free_state() {
        let mut rec = record();
        rec.claim("0xabc", "miner-a", Utc::now());
        assert_eq!(rec.status, VmStatus::Active);
        assert!(rec.check_invariants().is_ok());

        assert!(rec.release(Utc::now()));
        assert!(rec.is_free());
        assert!(rec.owner_address.is_none());
        assert!(rec.instance_name.is_none());
        assert!(rec.released_at.is_some());
        assert!(rec.check_invariants().is_ok());
    }

    #[test]
    fn release_of_inactive_is_noop() {
        let mut rec = record();
        assert!(!rec.release(Utc::now()));
        assert!(rec.released_at.is_none());
    }

    #[test]
    fn active_without_owner_is_rejected() {
        let mut rec = record();
        rec.status = VmStatus::Active;
        assert!(matches!(
            rec.check_invariants(),
            Err(StorageError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn inactive_with_owner_is_rejected() {
        let mut rec = record();
        rec.owner_address = Some("0xabc".to_string());
        assert!(rec.check_invariants().is_err());
    }

    #[test]
    fn serializes_camel_case_fields() {
        let mut rec = record();
        rec.claim("0xabc", "miner-a", Utc::now());
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["vmId"], "vm-1");
        assert_eq!(json["status"], "active");
        assert_eq!(json["ownerAddress"], "0xabc");
        assert!(json.get("assignedAt").is_some());
    }

    #[test]
    fn accepts_legacy_miner_address_field() {
        let json = serde_json::json!({
            "vmId": "vm-9",
            "status": "active",
            "minerAddress": "0xdef",
            "instanceName": "legacy",
            "createdAt": "2024-01-01T00:00:00Z"
        });
        let rec: VmRecord = serde_json::from_value(json).unwrap();
        assert_eq!(rec.owner_address.as_deref(), Some("0xdef"));
        assert!(rec.open_ports.is_empty());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("ACTIVE".parse::<VmStatus>().unwrap(), VmStatus::Active);
        assert!("retired".parse::<VmStatus>().is_err());
    }
}
