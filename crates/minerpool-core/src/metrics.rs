//! Global atomic counters for pool observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a CLI command finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    allocations_reused: AtomicU64,
    allocations_created: AtomicU64,
    releases: AtomicU64,
    terminations: AtomicU64,
    deployments: AtomicU64,
    judge_successes: AtomicU64,
    judge_fallbacks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            allocations_reused: AtomicU64::new(0),
            allocations_created: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            terminations: AtomicU64::new(0),
            deployments: AtomicU64::new(0),
            judge_successes: AtomicU64::new(0),
            judge_fallbacks: AtomicU64::new(0),
        }
    }

    /// An allocation was served from the free list.
    pub fn inc_allocations_reused(&self) {
        self.allocations_reused.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "allocations_reused", "counter incremented");
    }

    /// An allocation had to provision a new VM.
    pub fn inc_allocations_created(&self) {
        self.allocations_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "allocations_created", "counter incremented");
    }

    pub fn inc_releases(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "releases", "counter incremented");
    }

    pub fn inc_terminations(&self) {
        self.terminations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "terminations", "counter incremented");
    }

    pub fn inc_deployments(&self) {
        self.deployments.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deployments", "counter incremented");
    }

    pub fn inc_judge_successes(&self) {
        self.judge_successes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "judge_successes", "counter incremented");
    }

    /// The judge produced no usable score and the heuristics took over.
    pub fn inc_judge_fallbacks(&self) {
        self.judge_fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "judge_fallbacks", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            allocations_reused = self.allocations_reused(),
            allocations_created = self.allocations_created(),
            releases = self.releases(),
            terminations = self.terminations(),
            deployments = self.deployments(),
            judge_successes = self.judge_successes(),
            judge_fallbacks = self.judge_fallbacks(),
        );
    }

    pub fn allocations_reused(&self) -> u64 {
        self.allocations_reused.load(Ordering::Relaxed)
    }

    pub fn allocations_created(&self) -> u64 {
        self.allocations_created.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    pub fn terminations(&self) -> u64 {
        self.terminations.load(Ordering::Relaxed)
    }

    pub fn deployments(&self) -> u64 {
        self.deployments.load(Ordering::Relaxed)
    }

    pub fn judge_successes(&self) -> u64 {
        self.judge_successes.load(Ordering::Relaxed)
    }

    pub fn judge_fallbacks(&self) -> u64 {
        self.judge_fallbacks.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.allocations_reused.store(0, Ordering::Relaxed);
        self.allocations_created.store(0, Ordering::Relaxed);
        self.releases.store(0, Ordering::Relaxed);
        self.terminations.store(0, Ordering::Relaxed);
        self.deployments.store(0, Ordering::Relaxed);
        self.judge_successes.store(0, Ordering::Relaxed);
        self.judge_fallbacks.store(0, Ordering::Relaxed);
    }
}
