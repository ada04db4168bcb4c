//! Structured lifecycle events for the pool.
//!
//! Every event is an `info!` line carrying an `event` field so log pipelines
//! can filter on it. Use `RUST_LOG` to tune verbosity and `--json` on the CLI
//! for newline-delimited JSON.

use tracing::{info, warn};

/// Emit event: VM bound to an owner.
pub fn emit_vm_allocated(vm_id: &str, owner: &str, reused: bool) {
    info!(event = "vm.allocated", vm_id = %vm_id, owner = %owner, reused = reused);
}

pub fn emit_vm_released(vm_id: &str) {
    info!(event = "vm.released", vm_id = %vm_id);
}

pub fn emit_vm_terminated(vm_id: &str) {
    info!(event = "vm.terminated", vm_id = %vm_id);
}

/// Emit event: workload container started.
pub fn emit_workload_deployed(vm_id: &str, source: &str, port: u16, duration_ms: u64) {
    info!(
        event = "workload.deployed",
        vm_id = %vm_id,
        source = %source,
        port = port,
        duration_ms = duration_ms,
    );
}

pub fn emit_workload_stopped(vm_id: &str, container: &str) {
    info!(event = "workload.stopped", vm_id = %vm_id, container = %container);
}

/// Emit event: a candidate received its score.
pub fn emit_score(owner: &str, score: u8, strategy: &str) {
    info!(event = "score.emitted", owner = %owner, score = score, strategy = %strategy);
}

/// Emit event: judge gave no usable score (warning level).
pub fn emit_judge_fallback(reason: &dyn std::fmt::Display) {
    warn!(event = "judge.fallback", reason = %reason);
}

pub fn emit_registry_published(topic: &str, reference: &str, confirmed: bool) {
    info!(
        event = "registry.published",
        topic = %topic,
        reference = %reference,
        confirmed = confirmed,
    );
}

/// Emit event: detached registry write failed (warning level).
pub fn emit_registry_publish_failed(topic: &str, error: &dyn std::fmt::Display) {
    warn!(event = "registry.publish_failed", topic = %topic, error = %error);
}
