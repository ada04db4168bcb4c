//! SurrealDB schema initialization for the deployment ledger

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all ledger tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing minerpool SurrealDB schema");
    init_vm_records_table(db).await?;
    Ok(())
}

/// Initialize `vm_records` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE vm_records {
///   vm_id:                   STRING (unique)
///   position:                INT    (insertion order)
///   status:                  STRING (provisioning | active | inactive | terminated)
///   owner_address:           STRING? (indexed)
///   instance_name:           STRING?
///   public_network_address:  STRING?
///   open_ports:              ARRAY<OBJECT>
///   created_at:              DATETIME
///   assigned_at:             DATETIME?
///   released_at:             DATETIME?
/// }
/// ```
async fn init_vm_records_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing vm_records table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS vm_records SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_vm_id ON TABLE vm_records COLUMNS vm_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_status ON TABLE vm_records COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_owner ON TABLE vm_records COLUMNS owner_address;
        DEFINE INDEX IF NOT EXISTS idx_position ON TABLE vm_records COLUMNS position;
    "#;

    db.query(sql)
        .await
        .and_then(|res| res.check())
        .map_err(|e| StorageError::Backend(format!("schema setup failed: {e}")))?;

    Ok(())
}
