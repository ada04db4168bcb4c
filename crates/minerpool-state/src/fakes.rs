//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryDeploymentLedger`, which satisfies the `DeploymentLedger`
//! contract without any external dependencies, plus switches to make
//! individual reads or writes fail.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{VmId, VmRecord};
use crate::storage_traits::*;

/// In-memory deployment ledger backed by an ordered `Vec<VmRecord>`.
#[derive(Debug, Default)]
pub struct MemoryDeploymentLedger {
    records: Mutex<Vec<VmRecord>>,
    faults: Mutex<Faults>,
}

#[derive(Debug, Default)]
struct Faults {
    refused_writes: HashSet<VmId>,
    fail_reads: bool,
}

impl MemoryDeploymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the ledger with existing records (insertion order preserved).
    pub fn with_records(records: Vec<VmRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            faults: Mutex::default(),
        }
    }

    /// Fail every `put` of `vm_id` with a backend error.
    pub fn refuse_writes_for(&self, vm_id: &VmId) {
        self.faults.lock().unwrap().refused_writes.insert(vm_id.clone());
    }

    /// Fail every `get` and `list` while set.
    pub fn fail_reads(&self, fail: bool) {
        self.faults.lock().unwrap().fail_reads = fail;
    }

    fn check_read(&self) -> StorageResult<()> {
        if self.faults.lock().unwrap().fail_reads {
            return Err(StorageError::Backend("injected read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeploymentLedger for MemoryDeploymentLedger {
    async fn list(&self) -> StorageResult<Vec<VmRecord>> {
        self.check_read()?;
        let records = self.records.lock().unwrap();
        Ok(records.clone())
    }

    async fn get(&self, vm_id: &VmId) -> StorageResult<Option<VmRecord>> {
        self.check_read()?;
        let records = self.records.lock().unwrap();
        Ok(records.iter().find(|r| &r.vm_id == vm_id).cloned())
    }

    async fn put(&self, record: VmRecord) -> StorageResult<()> {
        record.check_invariants()?;
        if self.faults.lock().unwrap().refused_writes.contains(&record.vm_id) {
            return Err(StorageError::Backend(format!(
                "injected write failure for {}",
                record.vm_id
            )));
        }
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.vm_id == record.vm_id) {
            Some(slot) => *slot = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn remove(&self, vm_id: &VmId) -> StorageResult<bool> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| &r.vm_id != vm_id);
        Ok(records.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn injected_faults_hit_only_their_targets() {
        let ledger = MemoryDeploymentLedger::new();
        ledger.refuse_writes_for(&VmId::new("bad"));

        assert!(ledger.put(VmRecord::inactive(VmId::new("bad"), Utc::now())).await.is_err());
        ledger.put(VmRecord::inactive(VmId::new("ok"), Utc::now())).await.unwrap();

        ledger.fail_reads(true);
        assert!(ledger.get(&VmId::new("ok")).await.is_err());
        assert!(ledger.list().await.is_err());
        ledger.fail_reads(false);
        assert_eq!(ledger.list().await.unwrap().len(), 1);
    }
}
