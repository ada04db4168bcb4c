//! End-to-end pool behaviour over in-memory fakes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use minerpool_core::{
    AllocationManager, ContainerOrchestrator, MemoryRegistry, OrchestratorConfig, Pool, PoolError,
    Publication, RegistryBridge, RegistryConfig, RegistryError, ScoringEngine, TopicMessage,
    ValidationRequest, WorkloadSource,
};
use minerpool_provider::fakes::{ScriptedReply, ScriptedVmProvider};
use minerpool_provider::{ProvisionSpec, SshCredentials};
use minerpool_state::fakes::MemoryDeploymentLedger;
use minerpool_state::{DeploymentLedger, JsonFileLedger, OpenPort, VmId, VmRecord, VmStatus};
use serde_json::Value;

struct Harness {
    pool: Arc<Pool>,
    provider: Arc<ScriptedVmProvider>,
    ledger: Arc<dyn DeploymentLedger>,
    registry: Arc<MemoryRegistry>,
}

async fn harness_with(ledger: Arc<dyn DeploymentLedger>) -> Harness {
    let provider = Arc::new(ScriptedVmProvider::new());
    let registry = Arc::new(MemoryRegistry::new());
    let allocator = AllocationManager::open(ledger.clone(), provider.clone(), ProvisionSpec::default())
        .await
        .unwrap();
    let orchestrator = ContainerOrchestrator::new(
        provider.clone(),
        SshCredentials::new("ubuntu", "/keys/test"),
        OrchestratorConfig::default(),
    );
    let pool = Pool::new(allocator, orchestrator, ScoringEngine::heuristic()).with_registry(
        registry.clone(),
        RegistryConfig::new("http://registry.test").with_topics("alloc", "scores"),
    );
    Harness {
        pool: Arc::new(pool),
        provider,
        ledger,
        registry,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryDeploymentLedger::new())).await
}

#[tokio::test]
async fn distinct_owners_never_share_an_active_vm() {
    // Some free capacity so the reuse and creation paths race each other.
    let now = Utc::now();
    let ledger = Arc::new(MemoryDeploymentLedger::with_records(
        ["free-1", "free-2", "free-3"]
            .into_iter()
            .map(|id| VmRecord::inactive(VmId::new(id), now))
            .collect(),
    ));
    let h = harness_with(ledger).await;
    h.provider.set_create_delay(Duration::from_millis(5));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let pool = h.pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.allocate(&format!("0xowner{i}"), "miner").await
        }));
    }
    let mut ids = HashSet::new();
    for task in tasks {
        let record = task.await.unwrap().unwrap();
        assert!(ids.insert(record.vm_id.clone()), "vm {} handed out twice", record.vm_id);
    }
    assert_eq!(ids.len(), 12);
    assert_eq!(h.provider.create_calls(), 9);

    let records = h.ledger.list().await.unwrap();
    assert!(records.iter().all(|r| r.status == VmStatus::Active));
    let owners: HashSet<_> = records.iter().filter_map(|r| r.owner_address.clone()).collect();
    assert_eq!(owners.len(), 12);
}

#[tokio::test]
async fn release_then_allocate_reuses_the_vm() {
    let h = harness().await;
    let first = h.pool.allocate("0xa", "m").await.unwrap();
    h.pool.release(&first.vm_id).await.unwrap();
    h.pool.release(&first.vm_id).await.unwrap();

    let second = h.pool.allocate("0xb", "m").await.unwrap();
    assert_eq!(second.vm_id, first.vm_id);
    assert_eq!(second.owner_address.as_deref(), Some("0xb"));
    assert_eq!(h.provider.create_calls(), 1);
}

#[tokio::test]
async fn allocation_is_published_before_returning() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    let published = h.registry.published("alloc");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0]["type"], "vm_allocated");
    assert_eq!(published[0]["vmId"], record.vm_id.as_str());
    assert_eq!(published[0]["ownerAddress"], "0xa");
}

#[tokio::test]
async fn unconfirmed_allocation_is_rolled_back() {
    let h = harness().await;
    h.registry.set_reject(Some("registry offline"));
    let err = h.pool.allocate("0xa", "m").await.unwrap_err();
    assert!(matches!(err, PoolError::Registry(_)));

    let records = h.ledger.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, VmStatus::Inactive);
    assert!(records[0].owner_address.is_none());

    h.registry.set_reject(None);
    let again = h.pool.allocate("0xb", "m").await.unwrap();
    assert_eq!(again.vm_id, records[0].vm_id);
}

#[tokio::test]
async fn terminate_unknown_vm_is_noop() {
    let h = harness().await;
    assert!(!h.pool.terminate(&VmId::new("ghost")).await.unwrap());
    assert!(h.provider.deleted().is_empty());
    assert!(h.registry.published("alloc").is_empty());
}

#[tokio::test]
async fn terminate_removes_record_and_publishes() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    assert!(h.pool.terminate(&record.vm_id).await.unwrap());
    assert!(h.pool.get(&record.vm_id).await.unwrap().is_none());
    let published = h.registry.published("alloc");
    assert_eq!(published.last().unwrap()["type"], "vm_terminated");
}

#[tokio::test]
async fn failed_termination_keeps_ledger_entry() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    h.provider.fail_delete("502 bad gateway");
    let err = h.pool.terminate(&record.vm_id).await.unwrap_err();
    assert!(matches!(err, PoolError::TerminationFailure { .. }));
    let kept = h.pool.get(&record.vm_id).await.unwrap().unwrap();
    assert_eq!(kept.status, VmStatus::Active);
}

#[tokio::test]
async fn successful_stop_releases_the_vm() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    h.pool
        .deploy(&record.vm_id, WorkloadSource::Url("https://x.io/Dockerfile".into()), None)
        .await
        .unwrap();
    assert!(h.provider.commands()[0].1.contains("-p 3000:3000"));

    assert_eq!(h.pool.stop(&record.vm_id, None).await.unwrap(), 0);
    let after = h.pool.get(&record.vm_id).await.unwrap().unwrap();
    assert_eq!(after.status, VmStatus::Inactive);
    assert!(after.released_at.is_some());
}

#[tokio::test]
async fn failed_stop_keeps_the_owner() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    h.provider.set_unreachable(&record.vm_id);
    let err = h.pool.stop(&record.vm_id, None).await.unwrap_err();
    assert!(err.is_retryable());
    let after = h.pool.get(&record.vm_id).await.unwrap().unwrap();
    assert_eq!(after.owner_address.as_deref(), Some("0xa"));
}

#[tokio::test]
async fn open_ports_merges_with_existing() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    let updated = h.pool.open_ports(&record.vm_id, &[8080, 22]).await.unwrap();

    let expected: Vec<_> = [22, 3000, 8080].into_iter().map(OpenPort::tcp).collect();
    assert_eq!(updated.open_ports.iter().copied().collect::<Vec<_>>(), expected);
    let updates = h.provider.updates();
    assert_eq!(updates[0].open_ports.as_ref().unwrap(), &expected);
}

#[tokio::test]
async fn open_ports_on_unknown_vm() {
    let h = harness().await;
    let err = h.pool.open_ports(&VmId::new("ghost"), &[80]).await.unwrap_err();
    assert!(matches!(err, PoolError::VmNotFound(_)));
}

#[tokio::test]
async fn exec_passthrough_returns_non_zero_exit() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    h.provider.push_reply(ScriptedReply::failed(3, "nope"));
    let out = h.pool.exec(&record.vm_id, "false").await.unwrap();
    assert_eq!(out.exit_code, 3);
}

#[tokio::test]
async fn json_ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vm_deployments.json");

    let h = harness_with(Arc::new(JsonFileLedger::new(&path))).await;
    let a = h.pool.allocate("0xa", "m").await.unwrap();
    let b = h.pool.allocate("0xb", "m").await.unwrap();
    h.pool.release(&b.vm_id).await.unwrap();
    h.pool.release(&a.vm_id).await.unwrap();

    // A fresh process rebuilds the free list in ledger order.
    let h = harness_with(Arc::new(JsonFileLedger::new(&path))).await;
    assert_eq!(h.pool.allocator().free_count().await, 2);
    let reused = h.pool.allocate("0xc", "m").await.unwrap();
    assert_eq!(reused.vm_id, a.vm_id);
}

#[tokio::test]
async fn validate_scores_and_publishes_in_background() {
    let h = harness().await;
    let request: ValidationRequest = serde_json::from_value(serde_json::json!({
        "question": "What is six times seven?",
        "truth": "The answer is 42",
        "candidates": [
            {"ownerId": "0xa", "candidate": "42"},
            {"ownerId": "0xb", "candidate": "41"},
            {"ownerId": "0xc", "candidate": "42"}
        ]
    }))
    .unwrap();

    let report = h.pool.validate(&request).await;
    let scores: Vec<u8> = report.scores.iter().map(|s| s.score).collect();
    assert_eq!(scores, vec![100, 0, 100]);

    assert!(h.pool.flush_publications().await);
    let published = h.registry.published("scores");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0]["scores"][1]["walletId"], "0xb");

    let board = h.pool.scoreboard().unwrap();
    let avg = board.averages(chrono::Duration::hours(24)).await.unwrap();
    assert_eq!(avg.get("0xa"), Some(&100));
}

#[tokio::test]
async fn terminate_in_flight_blocks_release_and_reuse() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    h.provider.set_delete_delay(Duration::from_millis(100));

    let terminating = {
        let pool = h.pool.clone();
        let vm_id = record.vm_id.clone();
        tokio::spawn(async move { pool.terminate(&vm_id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = h.pool.release(&record.vm_id).await.unwrap_err();
    assert!(matches!(err, PoolError::TerminationPending(_)));
    let other = h.pool.allocate("0xb", "m").await.unwrap();
    assert_ne!(other.vm_id, record.vm_id);

    assert!(terminating.await.unwrap().unwrap());
    assert!(h.pool.get(&record.vm_id).await.unwrap().is_none());
    let survivor = h.pool.get(&other.vm_id).await.unwrap().unwrap();
    assert_eq!(survivor.owner_address.as_deref(), Some("0xb"));
    assert_eq!(h.provider.deleted(), vec![record.vm_id]);
}

#[tokio::test]
async fn ledger_failure_while_provisioning_deletes_the_new_vm() {
    let ledger = Arc::new(MemoryDeploymentLedger::new());
    ledger.refuse_writes_for(&VmId::new("vm-1"));
    let h = harness_with(ledger.clone()).await;

    let err = h.pool.allocate("0xa", "m").await.unwrap_err();
    assert!(matches!(err, PoolError::Storage(_)));
    assert_eq!(h.provider.deleted(), vec![VmId::new("vm-1")]);
    assert!(h.ledger.list().await.unwrap().is_empty());
    assert!(h.registry.published("alloc").is_empty());
}

#[tokio::test]
async fn unrecorded_termination_is_reported_as_done() {
    let h = harness().await;
    let record = h.pool.allocate("0xa", "m").await.unwrap();
    h.registry.set_reject(Some("registry offline"));

    let err = h.pool.terminate(&record.vm_id).await.unwrap_err();
    assert!(matches!(err, PoolError::TerminationUnrecorded { ref vm_id, .. } if *vm_id == record.vm_id));
    assert!(h.pool.get(&record.vm_id).await.unwrap().is_none());
    assert_eq!(h.provider.deleted(), vec![record.vm_id.clone()]);
    assert!(!h.pool.terminate(&record.vm_id).await.unwrap());
}

/// Registry whose publishes take `delay` to land.
struct SlowRegistry {
    inner: MemoryRegistry,
    delay: Duration,
}

#[async_trait]
impl RegistryBridge for SlowRegistry {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<Publication, RegistryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.publish(topic, payload).await
    }

    async fn messages(&self, topic: &str, limit: usize) -> Result<Vec<TopicMessage>, RegistryError> {
        self.inner.messages(topic, limit).await
    }
}

async fn pool_with_registry(registry: Arc<dyn RegistryBridge>, timeout: Duration) -> Pool {
    let provider = Arc::new(ScriptedVmProvider::new());
    let allocator = AllocationManager::open(
        Arc::new(MemoryDeploymentLedger::new()),
        provider.clone(),
        ProvisionSpec::default(),
    )
    .await
    .unwrap();
    let orchestrator = ContainerOrchestrator::new(
        provider,
        SshCredentials::new("ubuntu", "/keys/test"),
        OrchestratorConfig::default(),
    );
    let mut topics = RegistryConfig::new("http://registry.test").with_topics("alloc", "scores");
    topics.request_timeout = timeout;
    Pool::new(allocator, orchestrator, ScoringEngine::heuristic()).with_registry(registry, topics)
}

fn one_candidate() -> ValidationRequest {
    serde_json::from_value(serde_json::json!({
        "question": "q",
        "truth": "42",
        "candidates": [{"ownerId": "0xa", "candidate": "42"}]
    }))
    .unwrap()
}

#[tokio::test]
async fn flush_waits_for_slow_score_publish() {
    let registry = Arc::new(SlowRegistry {
        inner: MemoryRegistry::new(),
        delay: Duration::from_millis(200),
    });
    let pool = pool_with_registry(registry.clone(), Duration::from_secs(5)).await;

    pool.validate(&one_candidate()).await;
    assert!(registry.inner.published("scores").is_empty());
    assert!(pool.flush_publications().await);
    assert_eq!(registry.inner.published("scores").len(), 1);
    assert!(pool.flush_publications().await);
}

#[tokio::test]
async fn flush_gives_up_after_registry_timeout() {
    let registry = Arc::new(SlowRegistry {
        inner: MemoryRegistry::new(),
        delay: Duration::from_secs(10),
    });
    let pool = pool_with_registry(registry.clone(), Duration::from_millis(50)).await;

    pool.validate(&one_candidate()).await;
    assert!(!pool.flush_publications().await);
    assert!(registry.inner.published("scores").is_empty());
}
