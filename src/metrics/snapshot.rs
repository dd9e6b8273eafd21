//! Point-in-time metrics snapshots and the provider contract that supplies them.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::segment::{MemoryTier, SegmentInfo};
use crate::providers::ProviderError;

/// Bytes in one GiB.
pub const GIB: u64 = 1 << 30;

/// Convert a GiB amount to bytes.
pub fn gib(value: f64) -> u64 {
    (value * GIB as f64).round() as u64
}

/// Convert bytes to GiB (for logging and the latency model).
pub fn to_gib(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Monotonically increasing cache counters reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub evicted: u64,
    pub quantized: u64,
    pub reuse_hits: u64,
    pub reuse_misses: u64,
    pub applies: u64,
    pub rollbacks: u64,
}

/// An immutable view of one namespace's cache at a point in time.
///
/// A new observation is always a new value. The segment inventory is shared
/// behind an `Arc`, so cloning a snapshot is cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Cache namespace this snapshot describes.
    pub namespace: String,

    /// Unix timestamp (ms) at capture.
    pub captured_at_ms: u64,

    pub hbm_used_bytes: u64,
    pub hbm_capacity_bytes: u64,
    pub ddr_used_bytes: u64,
    pub ddr_capacity_bytes: u64,

    /// 95th percentile request latency over the last window.
    pub p95_latency_ms: f64,

    /// Time to first token.
    pub ttft_ms: f64,

    /// Accuracy drift against the full-precision baseline, in percentage points.
    #[serde(default)]
    pub accuracy_delta_pct: f64,

    #[serde(default)]
    pub counters: CacheCounters,

    /// Segment inventory at capture time.
    #[serde(default = "empty_segments")]
    pub segments: Arc<[SegmentInfo]>,
}

fn empty_segments() -> Arc<[SegmentInfo]> {
    Arc::from(Vec::new())
}

impl MetricsSnapshot {
    /// Bytes used in the given tier.
    pub fn used_bytes(&self, tier: MemoryTier) -> u64 {
        match tier {
            MemoryTier::Hbm => self.hbm_used_bytes,
            MemoryTier::Ddr => self.ddr_used_bytes,
        }
    }

    /// Capacity of the given tier.
    pub fn capacity_bytes(&self, tier: MemoryTier) -> u64 {
        match tier {
            MemoryTier::Hbm => self.hbm_capacity_bytes,
            MemoryTier::Ddr => self.ddr_capacity_bytes,
        }
    }

    /// HBM usage as a fraction of capacity (0.0 - 1.0).
    pub fn hbm_utilization(&self) -> f64 {
        if self.hbm_capacity_bytes == 0 {
            return 0.0;
        }
        self.hbm_used_bytes as f64 / self.hbm_capacity_bytes as f64
    }

    /// Reuse hit ratio over the backend's lifetime.
    pub fn reuse_hit_ratio(&self) -> f64 {
        let total = self.counters.reuse_hits + self.counters.reuse_misses;
        if total == 0 {
            return 1.0;
        }
        self.counters.reuse_hits as f64 / total as f64
    }
}

/// Supplies consistent point-in-time snapshots. Must be safe to call concurrently.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn current_snapshot(&self, namespace: &str) -> Result<MetricsSnapshot, ProviderError>;
}
