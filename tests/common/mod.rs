//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use kvopt_autopilot::autopilot::controller::AutopilotController;
use kvopt_autopilot::cache::segment::{CacheFormat, MemoryTier, SegmentInfo, SegmentRef};
use kvopt_autopilot::config::Config;
use kvopt_autopilot::metrics::snapshot::{gib, CacheCounters, MetricsSnapshot, SnapshotProvider};
use kvopt_autopilot::providers::registry::{ProviderRegistry, Registration};
use kvopt_autopilot::providers::{
    CapabilityProvider, EvictOutcome, PluginType, ProviderError, QuantizeOutcome,
};

pub const NS: &str = "tenant-a";
pub const NOW: u64 = 10_000_000;

/// `count` segments of `bytes` each, all older than the recency guard.
/// Reuse rates cycle through 1..=5.
pub fn segments(count: usize, bytes: u64, format: CacheFormat) -> Vec<SegmentInfo> {
    (0..count)
        .map(|i| SegmentInfo {
            segment: SegmentRef::new(format!("{NS}/seg-{i:04}")),
            tier: MemoryTier::Hbm,
            bytes,
            format,
            last_access_ms: NOW - 600_000 + i as u64 * 1_000,
            reuse_rate: 1.0 + (i % 5) as f64,
            pinned: false,
        })
        .collect()
}

pub fn snapshot(hbm_gib: f64, p95_ms: f64, inventory: Vec<SegmentInfo>) -> MetricsSnapshot {
    MetricsSnapshot {
        namespace: NS.to_string(),
        captured_at_ms: NOW,
        hbm_used_bytes: gib(hbm_gib),
        hbm_capacity_bytes: gib(16.0),
        ddr_used_bytes: 0,
        ddr_capacity_bytes: gib(64.0),
        p95_latency_ms: p95_ms,
        ttft_ms: 150.0,
        accuracy_delta_pct: 0.0,
        counters: CacheCounters::default(),
        segments: Arc::from(inventory),
    }
}

/// 12.5 GiB of FP16 segments at P95 2100 ms: 1.5 GiB over an 11 GiB target.
pub fn pressured_snapshot() -> MetricsSnapshot {
    snapshot(12.5, 2100.0, segments(50, gib(0.25), CacheFormat::Fp16))
}

/// 16 GiB over an 11 GiB target, closable only by evicting all five Q4 segments.
pub fn five_evictions_snapshot() -> MetricsSnapshot {
    snapshot(16.0, 1500.0, segments(5, gib(1.0), CacheFormat::Q4))
}

/// Returns queued snapshots in order, then repeats the last one.
pub struct ScriptedSnapshots {
    queue: Mutex<VecDeque<MetricsSnapshot>>,
    last: Mutex<Option<MetricsSnapshot>>,
    delay: Option<Duration>,
}

impl ScriptedSnapshots {
    pub fn new(snapshots: Vec<MetricsSnapshot>) -> Self {
        Self {
            queue: Mutex::new(snapshots.into()),
            last: Mutex::new(None),
            delay: None,
        }
    }

    pub fn delayed(snapshots: Vec<MetricsSnapshot>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(snapshots)
        }
    }
}

#[async_trait]
impl SnapshotProvider for ScriptedSnapshots {
    async fn current_snapshot(&self, namespace: &str) -> Result<MetricsSnapshot, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.queue.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(snap) = next {
            *last = Some(snap);
        }
        (*last)
            .clone()
            .filter(|s| s.namespace == namespace)
            .ok_or_else(|| ProviderError::Backend(format!("no snapshot for {namespace}")))
    }
}

/// A provider that records every call and can fail, stall or block on demand.
pub struct ScriptedProvider {
    name: String,
    plugin_type: PluginType,
    freed_bytes: u64,
    reversible: bool,
    failing: Mutex<HashSet<SegmentRef>>,
    pub calls: Mutex<Vec<(String, SegmentRef)>>,
    applies: AtomicUsize,
    /// 1-based apply call that waits for `release` after signalling `reached`.
    gate_at: Option<usize>,
    /// The gated call fails once released.
    fail_at_gate: bool,
    pub reached: Notify,
    pub release: Notify,
}

impl ScriptedProvider {
    pub fn new(name: &str, plugin_type: PluginType, freed_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            plugin_type,
            freed_bytes,
            reversible: true,
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            applies: AtomicUsize::new(0),
            gate_at: None,
            fail_at_gate: false,
            reached: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn irreversible(mut self) -> Self {
        self.reversible = false;
        self
    }

    pub fn gated_at(mut self, call: usize) -> Self {
        self.gate_at = Some(call);
        self
    }

    pub fn fail_at_gate(mut self) -> Self {
        self.fail_at_gate = true;
        self
    }

    pub fn fail_on(self, segment: &str) -> Self {
        self.failing.lock().unwrap().insert(SegmentRef::new(segment));
        self
    }

    pub fn calls(&self) -> Vec<(String, SegmentRef)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|(o, _)| o == op).count()
    }

    async fn apply(&self, op: &str, segment: &SegmentRef) -> Result<(), ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), segment.clone()));
        if self.failing.lock().unwrap().contains(segment) {
            return Err(ProviderError::Backend(format!("{op} failed for {segment}")));
        }
        let n = self.applies.fetch_add(1, Ordering::SeqCst) + 1;
        if self.gate_at == Some(n) {
            self.reached.notify_one();
            self.release.notified().await;
            if self.fail_at_gate {
                return Err(ProviderError::Backend(format!("{op} failed for {segment}")));
            }
        }
        Ok(())
    }

    fn revert(&self, op: &str, segment: &SegmentRef) -> Result<(), ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), segment.clone()));
        Ok(())
    }
}

#[async_trait]
impl CapabilityProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    async fn evict(&self, segment: &SegmentRef) -> Result<EvictOutcome, ProviderError> {
        if self.plugin_type != PluginType::KvCache {
            return Err(self.unsupported("evict"));
        }
        self.apply("evict", segment).await?;
        Ok(EvictOutcome {
            freed_bytes: self.freed_bytes,
            restorable: self.reversible,
        })
    }

    async fn quantize(&self, segment: &SegmentRef) -> Result<QuantizeOutcome, ProviderError> {
        if self.plugin_type != PluginType::Quantization {
            return Err(self.unsupported("quantize"));
        }
        self.apply("quantize", segment).await?;
        Ok(QuantizeOutcome {
            freed_bytes: self.freed_bytes,
            reversible: self.reversible,
        })
    }

    async fn restore(&self, segment: &SegmentRef) -> Result<(), ProviderError> {
        self.revert("restore", segment)
    }

    async fn dequantize(&self, segment: &SegmentRef) -> Result<(), ProviderError> {
        self.revert("dequantize", segment)
    }
}

/// A provider list holding just `provider`.
pub fn only(provider: &Arc<ScriptedProvider>) -> Vec<Arc<dyn CapabilityProvider>> {
    let provider: Arc<dyn CapabilityProvider> = provider.clone();
    vec![provider]
}

pub fn registry(providers: Vec<Arc<dyn CapabilityProvider>>) -> Arc<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry
            .register(provider, Registration::default())
            .unwrap();
    }
    Arc::new(registry)
}

pub fn controller(
    config: Config,
    snapshots: Arc<dyn SnapshotProvider>,
    providers: Vec<Arc<dyn CapabilityProvider>>,
) -> Arc<AutopilotController> {
    Arc::new(AutopilotController::new(config, snapshots, registry(providers)).unwrap())
}

/// Wait until the namespace slot is released after a plan ends.
pub async fn wait_idle(controller: &AutopilotController, namespace: &str) {
    for _ in 0..200 {
        if controller.active_plan(namespace).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("namespace {namespace} never became idle");
}
