//! Aggregate autopilot counters.
//!
//! Updated with atomic increments so readers see them immediately, without
//! taking any plan or controller lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::autopilot::plan::ActionKind;

#[derive(Debug, Default)]
pub struct AutopilotCounters {
    submitted: AtomicU64,
    conflicts: AtomicU64,
    evicted: AtomicU64,
    quantized: AtomicU64,
    applies: AtomicU64,
    rollbacks: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    dry_runs: AtomicU64,
    aborted: AtomicU64,
    revert_failures: AtomicU64,
}

/// A plain copy of the counters, for exposition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub submitted: u64,
    pub conflicts: u64,
    pub evicted: u64,
    pub quantized: u64,
    pub applies: u64,
    pub rollbacks: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub dry_runs: u64,
    /// Lifecycles forced terminal by an internal error.
    pub aborted: u64,
    pub revert_failures: u64,
}

impl AutopilotCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one successfully applied action of the given kind.
    pub fn record_action(&self, kind: ActionKind) {
        match kind {
            ActionKind::Evict => self.evicted.fetch_add(1, Ordering::Relaxed),
            ActionKind::Quantize => self.quantized.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_apply(&self) {
        self.applies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dry_run(&self) {
        self.dry_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revert_failures(&self, count: usize) {
        self.revert_failures
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            quantized: self.quantized.load(Ordering::Relaxed),
            applies: self.applies.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            dry_runs: self.dry_runs.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            revert_failures: self.revert_failures.load(Ordering::Relaxed),
        }
    }
}
