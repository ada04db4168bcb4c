//! VM allocation and lifecycle
//!
//! `AllocationManager` decides whether an owner request reuses an idle VM or
//! provisions a new one. Claims, releases and terminations are serialized by
//! one async mutex that guards the in-memory free list and the set of VMs
//! with a termination in flight. The provider calls on the creation and
//! termination paths run outside it; a VM in the termination set can be
//! neither released nor claimed until the provider has answered.
//!
//! Reads (`list`, `get`) go straight to the ledger. A claim always re-reads
//! the record under the lock before writing it.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use minerpool_provider::{ProvisionSpec, VmProvider};
use minerpool_state::{DeploymentLedger, OpenPort, VmId, VmRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::free_list::FreeList;
use crate::metrics::METRICS;
use crate::obs;

/// Instance name used when the caller gives none.
pub const DEFAULT_INSTANCE_NAME: &str = "default-vm";

/// State guarded by the allocation lock.
#[derive(Debug)]
struct Slots {
    free: FreeList,
    terminating: HashSet<VmId>,
}

pub struct AllocationManager {
    ledger: Arc<dyn DeploymentLedger>,
    provider: Arc<dyn VmProvider>,
    provision: ProvisionSpec,
    slots: Mutex<Slots>,
}

impl AllocationManager {
    /// Build the manager, rebuilding the free list from the ledger.
    pub async fn open(
        ledger: Arc<dyn DeploymentLedger>,
        provider: Arc<dyn VmProvider>,
        provision: ProvisionSpec,
    ) -> Result<Self> {
        let records = ledger.list().await?;
        let free = FreeList::from_records(&records);
        debug!(records = records.len(), free = free.len(), "allocation manager opened");
        Ok(Self {
            ledger,
            provider,
            provision,
            slots: Mutex::new(Slots {
                free,
                terminating: HashSet::new(),
            }),
        })
    }

    pub fn ledger(&self) -> &Arc<dyn DeploymentLedger> {
        &self.ledger
    }

    pub fn provider(&self) -> &Arc<dyn VmProvider> {
        &self.provider
    }

    /// Number of VMs currently waiting for an owner.
    pub async fn free_count(&self) -> usize {
        self.slots.lock().await.free.len()
    }

    /// Bind a VM to `owner`, reusing the oldest idle VM or provisioning one.
    ///
    /// Returns the record as persisted, with `status = active`.
    pub async fn allocate(&self, owner: &str, instance_name: &str) -> Result<VmRecord> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(PoolError::InvalidRequest(
                "owner address must not be empty".to_string(),
            ));
        }
        let name = match instance_name.trim() {
            "" => DEFAULT_INSTANCE_NAME,
            n => n,
        };

        if let Some(record) = self.claim_free(owner, name).await? {
            METRICS.inc_allocations_reused();
            obs::emit_vm_allocated(record.vm_id.as_str(), owner, true);
            return Ok(record);
        }

        let record = self.provision_and_claim(owner, name).await?;
        METRICS.inc_allocations_created();
        obs::emit_vm_allocated(record.vm_id.as_str(), owner, false);
        Ok(record)
    }

    async fn claim_free(&self, owner: &str, name: &str) -> Result<Option<VmRecord>> {
        let mut slots = self.slots.lock().await;
        while let Some(vm_id) = slots.free.pop() {
            if slots.terminating.contains(&vm_id) {
                continue;
            }
            let mut record = match self.ledger.get(&vm_id).await {
                Ok(Some(record)) if record.is_free() => record,
                Ok(_) => {
                    debug!(vm_id = %vm_id, "dropping stale free-list entry");
                    continue;
                }
                Err(e) => {
                    slots.free.restore(vm_id);
                    return Err(e.into());
                }
            };
            record.claim(owner, name, Utc::now());
            if let Err(e) = self.ledger.put(record.clone()).await {
                slots.free.restore(vm_id);
                return Err(e.into());
            }
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Provision, then record the first machine as claimed and any extras as
    /// free capacity. Machines that cannot be recorded are deleted again.
    async fn provision_and_claim(&self, owner: &str, name: &str) -> Result<VmRecord> {
        let created = self
            .provider
            .create(&self.provision, name)
            .await
            .map_err(|e| PoolError::ProvisionFailure(e.to_string()))?;
        let created_ids: Vec<VmId> = created.iter().map(|vm| vm.vm_id.clone()).collect();

        let mut created = created.into_iter();
        let first = created.next().ok_or_else(|| {
            PoolError::ProvisionFailure("provider returned no machines".to_string())
        })?;

        let now = Utc::now();
        let mut record = VmRecord::inactive(first.vm_id, now);
        record.claim(owner, name, now);

        let mut slots = self.slots.lock().await;
        if let Err(e) = self.ledger.put(record.clone()).await {
            drop(slots);
            warn!(vm_id = %record.vm_id, error = %e, "provisioned vm not recorded, deleting");
            self.discard_unrecorded(&created_ids).await;
            return Err(e.into());
        }

        let mut unrecorded = Vec::new();
        for extra in created {
            match self.ledger.put(VmRecord::inactive(extra.vm_id.clone(), now)).await {
                Ok(()) => {
                    info!(vm_id = %extra.vm_id, "extra provisioned vm recorded as free capacity");
                    slots.free.push(extra.vm_id);
                }
                Err(e) => {
                    warn!(vm_id = %extra.vm_id, error = %e, "extra provisioned vm not recorded, deleting");
                    unrecorded.push(extra.vm_id);
                }
            }
        }
        drop(slots);

        if !unrecorded.is_empty() {
            self.discard_unrecorded(&unrecorded).await;
        }
        Ok(record)
    }

    /// Best-effort delete of machines the ledger never saw.
    async fn discard_unrecorded(&self, vm_ids: &[VmId]) {
        if let Err(e) = self.provider.delete(vm_ids).await {
            warn!(count = vm_ids.len(), error = %e, "unrecorded vms left at the provider");
        }
    }

    /// Return an active VM to the pool.
    ///
    /// Releasing an inactive or unknown VM is a no-op and returns `None`. A VM
    /// whose termination is in flight is refused with
    /// [`PoolError::TerminationPending`].
    pub async fn release(&self, vm_id: &VmId) -> Result<Option<VmRecord>> {
        let mut slots = self.slots.lock().await;
        if slots.terminating.contains(vm_id) {
            return Err(PoolError::TerminationPending(vm_id.clone()));
        }
        let Some(mut record) = self.ledger.get(vm_id).await? else {
            return Ok(None);
        };
        if !record.release(Utc::now()) {
            return Ok(None);
        }
        self.ledger.put(record.clone()).await?;
        slots.free.push(record.vm_id.clone());
        METRICS.inc_releases();
        obs::emit_vm_released(vm_id.as_str());
        Ok(Some(record))
    }

    /// Delete the VM at the provider, then drop its ledger record.
    ///
    /// Returns `false` for an unknown VM. When the provider refuses, the
    /// record is kept and [`PoolError::TerminationFailure`] is returned.
    pub async fn terminate(&self, vm_id: &VmId) -> Result<bool> {
        {
            let mut slots = self.slots.lock().await;
            if slots.terminating.contains(vm_id) {
                return Err(PoolError::TerminationPending(vm_id.clone()));
            }
            if self.ledger.get(vm_id).await?.is_none() {
                return Ok(false);
            }
            slots.free.remove(vm_id);
            slots.terminating.insert(vm_id.clone());
        }

        let deleted = self.provider.delete(std::slice::from_ref(vm_id)).await;

        let mut slots = self.slots.lock().await;
        slots.terminating.remove(vm_id);

        if let Err(e) = deleted {
            match self.ledger.get(vm_id).await {
                Ok(Some(record)) if record.is_free() => {
                    slots.free.push(vm_id.clone());
                }
                Ok(_) => {}
                Err(read_err) => {
                    // Claims re-read the record, so a non-free entry is dropped there.
                    warn!(vm_id = %vm_id, error = %read_err, "could not re-read vm after refused termination");
                    slots.free.push(vm_id.clone());
                }
            }
            warn!(vm_id = %vm_id, error = %e, "provider refused termination");
            return Err(PoolError::TerminationFailure {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            });
        }

        self.ledger.remove(vm_id).await?;
        slots.free.remove(vm_id);
        METRICS.inc_terminations();
        obs::emit_vm_terminated(vm_id.as_str());
        Ok(true)
    }

    pub async fn list(&self) -> Result<Vec<VmRecord>> {
        Ok(self.ledger.list().await?)
    }

    pub async fn get(&self, vm_id: &VmId) -> Result<Option<VmRecord>> {
        Ok(self.ledger.get(vm_id).await?)
    }

    /// Copy public addresses and open ports reported by the provider into
    /// the ledger. Returns how many records changed.
    pub async fn sync_from_provider(&self) -> Result<usize> {
        let reported = self.provider.list().await?;

        let _slots = self.slots.lock().await;
        let mut changed = 0;
        for vm in reported {
            let Some(mut record) = self.ledger.get(&vm.vm_id).await? else {
                continue;
            };
            let mut dirty = false;
            if vm.public_ip.is_some() && vm.public_ip != record.public_network_address {
                record.public_network_address = vm.public_ip;
                dirty = true;
            }
            if !vm.ports.is_empty() && vm.ports != record.open_ports {
                record.open_ports = vm.ports;
                dirty = true;
            }
            if dirty {
                self.ledger.put(record).await?;
                changed += 1;
            }
        }
        info!(changed, "ledger synced from provider");
        Ok(changed)
    }

    /// Replace the recorded open ports of a VM.
    pub async fn record_ports(&self, vm_id: &VmId, ports: BTreeSet<OpenPort>) -> Result<VmRecord> {
        let _slots = self.slots.lock().await;
        let mut record = self
            .ledger
            .get(vm_id)
            .await?
            .ok_or_else(|| PoolError::VmNotFound(vm_id.clone()))?;
        record.open_ports = ports;
        self.ledger.put(record.clone()).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minerpool_provider::fakes::ScriptedVmProvider;
    use minerpool_state::fakes::MemoryDeploymentLedger;
    use minerpool_state::VmStatus;

    async fn manager_with(
        records: Vec<VmRecord>,
    ) -> (AllocationManager, Arc<ScriptedVmProvider>, Arc<MemoryDeploymentLedger>) {
        let ledger = Arc::new(MemoryDeploymentLedger::with_records(records));
        let provider = Arc::new(ScriptedVmProvider::new());
        let manager = AllocationManager::open(
            ledger.clone(),
            provider.clone(),
            ProvisionSpec::default(),
        )
        .await
        .unwrap();
        (manager, provider, ledger)
    }

    #[tokio::test]
    async fn empty_owner_is_rejected() {
        let (manager, provider, _) = manager_with(vec![]).await;
        let err = manager.allocate("   ", "x").await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidRequest(_)));
        assert_eq!(provider.create_calls(), 0);
    }

    #[tokio::test]
    async fn blank_instance_name_defaults() {
        let (manager, provider, _) = manager_with(vec![]).await;
        let record = manager.allocate("0xabc", "").await.unwrap();
        assert_eq!(record.instance_name.as_deref(), Some(DEFAULT_INSTANCE_NAME));
        assert_eq!(provider.created_names(), vec![DEFAULT_INSTANCE_NAME]);
    }

    #[tokio::test]
    async fn reuses_oldest_inactive_first() {
        let now = Utc::now();
        let (manager, provider, _) = manager_with(vec![
            VmRecord::inactive(VmId::new("old"), now),
            VmRecord::inactive(VmId::new("newer"), now),
        ])
        .await;

        let record = manager.allocate("0xabc", "miner").await.unwrap();
        assert_eq!(record.vm_id, VmId::new("old"));
        assert_eq!(record.status, VmStatus::Active);
        assert_eq!(record.owner_address.as_deref(), Some("0xabc"));
        assert!(record.assigned_at.is_some());
        assert_eq!(provider.create_calls(), 0);
        assert_eq!(manager.free_count().await, 1);
    }

    #[tokio::test]
    async fn provisions_when_no_free_vm() {
        let (manager, provider, ledger) = manager_with(vec![]).await;
        let record = manager.allocate("0xabc", "miner").await.unwrap();
        assert_eq!(record.vm_id, VmId::new("vm-1"));
        assert_eq!(provider.create_calls(), 1);
        assert_eq!(ledger.list().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn provision_failure_leaves_no_record() {
        let (manager, provider, ledger) = manager_with(vec![]).await;
        provider.fail_create("quota exceeded");
        let err = manager.allocate("0xabc", "miner").await.unwrap_err();
        assert!(matches!(err, PoolError::ProvisionFailure(ref m) if m.contains("quota")));
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn extra_instances_become_free_capacity() {
        let ledger = Arc::new(MemoryDeploymentLedger::new());
        let provider = Arc::new(ScriptedVmProvider::new());
        let spec = ProvisionSpec {
            instances: 3,
            ..ProvisionSpec::default()
        };
        let manager = AllocationManager::open(ledger.clone(), provider.clone(), spec)
            .await
            .unwrap();

        let first = manager.allocate("0xa", "m").await.unwrap();
        assert_eq!(first.vm_id, VmId::new("vm-1"));
        assert_eq!(manager.free_count().await, 2);

        let second = manager.allocate("0xb", "m").await.unwrap();
        assert_eq!(second.vm_id, VmId::new("vm-2"));
        assert_eq!(provider.create_calls(), 1);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_stamps_time() {
        let (manager, _, _) = manager_with(vec![]).await;
        let record = manager.allocate("0xabc", "m").await.unwrap();

        let released = manager.release(&record.vm_id).await.unwrap().unwrap();
        assert_eq!(released.status, VmStatus::Inactive);
        assert!(released.owner_address.is_none());
        assert!(released.instance_name.is_none());
        assert!(released.assigned_at.is_none());
        assert!(released.released_at.is_some());

        assert!(manager.release(&record.vm_id).await.unwrap().is_none());
        assert!(manager.release(&VmId::new("ghost")).await.unwrap().is_none());
        assert_eq!(manager.free_count().await, 1);
    }

    #[tokio::test]
    async fn terminate_unknown_is_noop() {
        let (manager, provider, _) = manager_with(vec![]).await;
        assert!(!manager.terminate(&VmId::new("ghost")).await.unwrap());
        assert!(provider.deleted().is_empty());
    }

    #[tokio::test]
    async fn terminate_failure_keeps_record_and_free_slot() {
        let now = Utc::now();
        let (manager, provider, ledger) =
            manager_with(vec![VmRecord::inactive(VmId::new("idle"), now)]).await;
        provider.fail_delete("provider down");

        let err = manager.terminate(&VmId::new("idle")).await.unwrap_err();
        assert!(matches!(err, PoolError::TerminationFailure { .. }));
        assert!(ledger.get(&VmId::new("idle")).await.unwrap().is_some());
        assert_eq!(manager.free_count().await, 1);
    }

    #[tokio::test]
    async fn terminated_vm_is_never_reused() {
        let now = Utc::now();
        let (manager, provider, _) =
            manager_with(vec![VmRecord::inactive(VmId::new("idle"), now)]).await;
        assert!(manager.terminate(&VmId::new("idle")).await.unwrap());
        assert_eq!(provider.deleted(), vec![VmId::new("idle")]);

        let record = manager.allocate("0xabc", "m").await.unwrap();
        assert_ne!(record.vm_id, VmId::new("idle"));
        assert_eq!(provider.create_calls(), 1);
    }

    #[tokio::test]
    async fn stale_free_entries_are_skipped() {
        let now = Utc::now();
        let (manager, _, ledger) =
            manager_with(vec![VmRecord::inactive(VmId::new("a"), now)]).await;
        // Someone else claimed it behind the manager's back.
        let mut taken = ledger.get(&VmId::new("a")).await.unwrap().unwrap();
        taken.claim("0xother", "n", now);
        ledger.put(taken).await.unwrap();

        let record = manager.allocate("0xabc", "m").await.unwrap();
        assert_eq!(record.vm_id, VmId::new("vm-1"));
    }

    #[tokio::test]
    async fn sync_copies_address_and_ports() {
        let (manager, _, ledger) = manager_with(vec![]).await;
        let record = manager.allocate("0xabc", "m").await.unwrap();
        assert!(record.public_network_address.is_none());

        assert_eq!(manager.sync_from_provider().await.unwrap(), 1);
        let synced = ledger.get(&record.vm_id).await.unwrap().unwrap();
        assert_eq!(synced.public_network_address.as_deref(), Some("10.0.0.1"));
        assert!(synced.open_ports.contains(&OpenPort::tcp(22)));
        assert_eq!(synced.owner_address.as_deref(), Some("0xabc"));

        assert_eq!(manager.sync_from_provider().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_and_claims_wait_out_an_inflight_termination() {
        let (manager, provider, ledger) = manager_with(vec![]).await;
        let manager = Arc::new(manager);
        let record = manager.allocate("0xa", "m").await.unwrap();
        provider.set_delete_delay(std::time::Duration::from_millis(100));

        let terminating = {
            let manager = manager.clone();
            let vm_id = record.vm_id.clone();
            tokio::spawn(async move { manager.terminate(&vm_id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let err = manager.release(&record.vm_id).await.unwrap_err();
        assert!(matches!(err, PoolError::TerminationPending(ref id) if *id == record.vm_id));
        let other = manager.allocate("0xb", "m").await.unwrap();
        assert_ne!(other.vm_id, record.vm_id);

        assert!(terminating.await.unwrap().unwrap());
        assert!(ledger.get(&record.vm_id).await.unwrap().is_none());
        let kept = ledger.get(&other.vm_id).await.unwrap().unwrap();
        assert_eq!(kept.owner_address.as_deref(), Some("0xb"));
    }

    #[tokio::test]
    async fn second_terminate_of_same_vm_is_refused_while_first_runs() {
        let (manager, provider, _) = manager_with(vec![]).await;
        let manager = Arc::new(manager);
        let record = manager.allocate("0xa", "m").await.unwrap();
        provider.set_delete_delay(std::time::Duration::from_millis(50));

        let first = {
            let manager = manager.clone();
            let vm_id = record.vm_id.clone();
            tokio::spawn(async move { manager.terminate(&vm_id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let err = manager.terminate(&record.vm_id).await.unwrap_err();
        assert!(matches!(err, PoolError::TerminationPending(_)));
        assert!(first.await.unwrap().unwrap());
        assert_eq!(provider.deleted(), vec![record.vm_id]);
    }

    #[tokio::test]
    async fn refused_termination_lets_release_through_again() {
        let (manager, provider, _) = manager_with(vec![]).await;
        let record = manager.allocate("0xa", "m").await.unwrap();
        provider.fail_delete("provider down");

        assert!(manager.terminate(&record.vm_id).await.is_err());
        let released = manager.release(&record.vm_id).await.unwrap().unwrap();
        assert_eq!(released.status, VmStatus::Inactive);
        assert_eq!(manager.free_count().await, 1);
    }

    #[tokio::test]
    async fn unreadable_ledger_after_refused_termination_keeps_free_slot() {
        let now = Utc::now();
        let (manager, provider, ledger) =
            manager_with(vec![VmRecord::inactive(VmId::new("idle"), now)]).await;
        let manager = Arc::new(manager);
        provider.fail_delete("provider down");
        provider.set_delete_delay(std::time::Duration::from_millis(50));

        let terminating = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.terminate(&VmId::new("idle")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        ledger.fail_reads(true);
        let err = terminating.await.unwrap().unwrap_err();
        assert!(matches!(err, PoolError::TerminationFailure { .. }));
        ledger.fail_reads(false);

        assert_eq!(manager.free_count().await, 1);
        let record = manager.allocate("0xabc", "m").await.unwrap();
        assert_eq!(record.vm_id, VmId::new("idle"));
    }

    #[tokio::test]
    async fn unrecorded_provisioned_vm_is_deleted() {
        let (manager, provider, ledger) = manager_with(vec![]).await;
        ledger.refuse_writes_for(&VmId::new("vm-1"));

        let err = manager.allocate("0xabc", "m").await.unwrap_err();
        assert!(matches!(err, PoolError::Storage(_)));
        assert_eq!(provider.deleted(), vec![VmId::new("vm-1")]);
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrecorded_extra_does_not_fail_the_claim() {
        let ledger = Arc::new(MemoryDeploymentLedger::new());
        let provider = Arc::new(ScriptedVmProvider::new());
        let spec = ProvisionSpec {
            instances: 3,
            ..ProvisionSpec::default()
        };
        let manager = AllocationManager::open(ledger.clone(), provider.clone(), spec)
            .await
            .unwrap();
        ledger.refuse_writes_for(&VmId::new("vm-2"));

        let record = manager.allocate("0xabc", "m").await.unwrap();
        assert_eq!(record.vm_id, VmId::new("vm-1"));
        assert_eq!(provider.deleted(), vec![VmId::new("vm-2")]);
        assert_eq!(manager.free_count().await, 1);
        let ids: Vec<_> = ledger.list().await.unwrap().into_iter().map(|r| r.vm_id).collect();
        assert_eq!(ids, vec![VmId::new("vm-1"), VmId::new("vm-3")]);
    }
}
