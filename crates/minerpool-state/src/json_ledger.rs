//! Whole-document JSON ledger
//!
//! The ledger is a single JSON array of VM records. Every mutation reads the
//! whole document, edits it in memory, and rewrites it via a temp file in the
//! same directory followed by an atomic rename, so readers never observe a
//! half-written document.
//!
//! Documents written by older tooling are normalized on load:
//! nested arrays are flattened, non-object entries are dropped, and records
//! without a `status` default to `inactive`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::schema::{VmId, VmRecord, VmStatus};
use crate::storage_traits::{DeploymentLedger, StorageResult};

/// JSON-file-backed implementation of [`DeploymentLedger`].
pub struct JsonFileLedger {
    path: Arc<PathBuf>,
    write_lock: Mutex<()>,
}

impl JsonFileLedger {
    /// Open (or lazily create) the ledger at `path`. The file is only written
    /// on the first mutation.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Arc::new(path.as_ref().to_path_buf()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StorageResult<Vec<VmRecord>> {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || load_document(&path))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
    }

    async fn store(&self, records: Vec<VmRecord>) -> StorageResult<()> {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || write_document(&path, &records))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
    }
}

fn load_document(path: &Path) -> StorageResult<Vec<VmRecord>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::Io(e)),
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| StorageError::Corrupt(format!("{}: {}", path.display(), e)))?;
    Ok(normalize_document(value))
}

/// Flatten legacy layouts into a list of valid records.
pub(crate) fn normalize_document(value: Value) -> Vec<VmRecord> {
    let top = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    let mut objects = Vec::new();
    for item in top {
        match item {
            Value::Array(nested) => objects.extend(nested.into_iter().filter(Value::is_object)),
            obj @ Value::Object(_) => objects.push(obj),
            _ => {}
        }
    }

    let mut records = Vec::with_capacity(objects.len());
    for mut obj in objects {
        if let Some(map) = obj.as_object_mut() {
            map.entry("status")
                .or_insert_with(|| Value::String("inactive".to_string()));
        }
        match serde_json::from_value::<VmRecord>(obj) {
            Ok(mut record) => {
                if record.status == VmStatus::Active && record.check_invariants().is_err() {
                    warn!(vm_id = %record.vm_id, "active record without owner, demoting to inactive");
                    record.status = VmStatus::Inactive;
                    record.owner_address = None;
                }
                if record.status == VmStatus::Inactive {
                    record.owner_address = None;
                }
                if records.iter().any(|r: &VmRecord| r.vm_id == record.vm_id) {
                    warn!(vm_id = %record.vm_id, "duplicate record in ledger, keeping first");
                    continue;
                }
                records.push(record);
            }
            Err(e) => warn!(error = %e, "skipping unreadable ledger entry"),
        }
    }
    records
}

fn write_document(path: &Path, records: &[VmRecord]) -> StorageResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let body = serde_json::to_vec_pretty(records)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), records = records.len(), "ledger document rewritten");
    Ok(())
}

#[async_trait]
impl DeploymentLedger for JsonFileLedger {
    async fn list(&self) -> StorageResult<Vec<VmRecord>> {
        self.load().await
    }

    async fn get(&self, vm_id: &VmId) -> StorageResult<Option<VmRecord>> {
        let records = self.load().await?;
        Ok(records.into_iter().find(|r| &r.vm_id == vm_id))
    }

    async fn put(&self, record: VmRecord) -> StorageResult<()> {
        record.check_invariants()?;
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        match records.iter_mut().find(|r| r.vm_id == record.vm_id) {
            Some(slot) => *slot = record,
            None => records.push(record),
        }
        self.store(records).await
    }

    async fn remove(&self, vm_id: &VmId) -> StorageResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|r| &r.vm_id != vm_id);
        if records.len() == before {
            return Ok(false);
        }
        self.store(records).await?;
        Ok(true)
    }
}
