//! SurrealDB-backed DeploymentLedger implementation
//!
//! Rows live in the `vm_records` table. `put` replaces a row inside a single
//! transaction (delete + create) so a record is never observed half-written,
//! and the original `position` is carried over to keep insertion order.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::schema::{OpenPort, VmId, VmRecord};
use crate::storage_traits::{DeploymentLedger, StorageResult};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&SurrealDatetime::from(*date), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(DateTime::from(SurrealDatetime::deserialize(deserializer)?))
    }
}

mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&date.map(SurrealDatetime::from), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Configuration for a remote SurrealDB connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "minerpool")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "minerpool")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "minerpool".to_string());
        let database = std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Row layout of the `vm_records` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbVmRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<surrealdb::sql::Thing>,
    vm_id: String,
    position: i64,
    status: String,
    owner_address: Option<String>,
    instance_name: Option<String>,
    public_network_address: Option<String>,
    #[serde(default)]
    open_ports: Vec<OpenPort>,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    assigned_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    released_at: Option<DateTime<Utc>>,
}

impl DbVmRecord {
    fn from_record(record: VmRecord, position: i64) -> Self {
        Self {
            id: None,
            vm_id: record.vm_id.0,
            position,
            status: record.status.as_str().to_string(),
            owner_address: record.owner_address,
            instance_name: record.instance_name,
            public_network_address: record.public_network_address,
            open_ports: record.open_ports.into_iter().collect(),
            created_at: record.created_at,
            assigned_at: record.assigned_at,
            released_at: record.released_at,
        }
    }

    fn into_record(self) -> StorageResult<VmRecord> {
        Ok(VmRecord {
            vm_id: VmId(self.vm_id),
            status: self.status.parse()?,
            owner_address: self.owner_address,
            instance_name: self.instance_name,
            public_network_address: self.public_network_address,
            open_ports: self.open_ports.into_iter().collect::<BTreeSet<_>>(),
            created_at: self.created_at,
            assigned_at: self.assigned_at,
            released_at: self.released_at,
        })
    }
}

/// SurrealDB-backed implementation of [`DeploymentLedger`].
pub struct SurrealDeploymentLedger {
    db: Surreal<Any>,
}

impl SurrealDeploymentLedger {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `minerpool/main`, and runs `init_schema`.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect_url("mem://").await
    }

    /// Create from environment variables.
    ///
    /// Resolution order: `SURREALDB_ENDPOINT` cloud config, then
    /// `SURREALDB_URL`, then local persistence under `.minerpool/db`.
    pub async fn from_env() -> StorageResult<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            let db = surrealdb::engine::any::connect(&config.endpoint)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;

            if config.is_root {
                db.signin(Root {
                    username: &config.username,
                    password: &config.password,
                })
                .await
                .map_err(|e| StorageError::Connection(format!("Root auth failed: {e}")))?;
            } else {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username: &config.username,
                    password: &config.password,
                })
                .await
                .map_err(|e| StorageError::Connection(format!("DB auth failed: {e}")))?;
            }

            db.use_ns(&config.namespace)
                .use_db(&config.database)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;

            migrations::init_schema(&db).await?;
            info!("SurrealDeploymentLedger connected (cloud)");
            return Ok(Self { db });
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect_url(&url).await;
        }

        let path = ".minerpool/db";
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
        Self::connect_url(&format!("surrealkv://{}", path)).await
    }

    async fn connect_url(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns("minerpool")
            .use_db("main")
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealDeploymentLedger connected ({})", url);
        Ok(Self { db })
    }

    async fn fetch_row(&self, vm_id: &VmId) -> StorageResult<Option<DbVmRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM vm_records WHERE vm_id = $vid")
            .bind(("vid", vm_id.0.clone()))
            .await?;
        let rows: Vec<DbVmRecord> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn next_position(&self) -> StorageResult<i64> {
        let mut res = self
            .db
            .query("SELECT VALUE position FROM vm_records ORDER BY position DESC LIMIT 1")
            .await?;
        let max: Vec<i64> = res.take(0)?;
        Ok(max.first().map(|p| p + 1).unwrap_or(0))
    }
}

#[async_trait]
impl DeploymentLedger for SurrealDeploymentLedger {
    async fn list(&self) -> StorageResult<Vec<VmRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM vm_records ORDER BY position ASC")
            .await?;
        let rows: Vec<DbVmRecord> = res.take(0)?;
        rows.into_iter().map(DbVmRecord::into_record).collect()
    }

    async fn get(&self, vm_id: &VmId) -> StorageResult<Option<VmRecord>> {
        self.fetch_row(vm_id)
            .await?
            .map(DbVmRecord::into_record)
            .transpose()
    }

    async fn put(&self, record: VmRecord) -> StorageResult<()> {
        record.check_invariants()?;
        let position = match self.fetch_row(&record.vm_id).await? {
            Some(existing) => existing.position,
            None => self.next_position().await?,
        };
        let vid = record.vm_id.0.clone();
        let row = DbVmRecord::from_record(record, position);
        debug!(vm_id = %vid, status = %row.status, "writing vm record");

        self.db
            .query(
                "BEGIN TRANSACTION;
                 DELETE vm_records WHERE vm_id = $vid;
                 CREATE vm_records CONTENT $row;
                 COMMIT TRANSACTION;",
            )
            .bind(("vid", vid))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    async fn remove(&self, vm_id: &VmId) -> StorageResult<bool> {
        if self.fetch_row(vm_id).await?.is_none() {
            return Ok(false);
        }
        self.db
            .query("DELETE vm_records WHERE vm_id = $vid")
            .bind(("vid", vm_id.0.clone()))
            .await?
            .check()?;
        Ok(true)
    }
}
