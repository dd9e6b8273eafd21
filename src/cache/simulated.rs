//! In-memory simulated KV cache.
//!
//! Stands in for a real serving backend in the CLI and in tests. It keeps a
//! segment inventory with per-tier accounting, derives P95 latency from HBM
//! usage, and serves the snapshot and capability contracts:
//!
//! - [`SimulatedCache`]: shared state, implements [`SnapshotProvider`]
//! - [`SimulatedEvictor`]: KV_CACHE provider (evict / restore)
//! - [`SimulatedQuantizer`]: QUANTIZATION provider (quantize / dequantize)
//!
//! Faults (per-segment failures, call delays) can be injected to exercise
//! rollback paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cache::segment::{CacheFormat, MemoryTier, SegmentInfo, SegmentRef};
use crate::config::SimulationConfig;
use crate::metrics::snapshot::{now_ms, to_gib, CacheCounters, MetricsSnapshot, SnapshotProvider};
use crate::providers::{CapabilityProvider, EvictOutcome, PluginType, ProviderError, QuantizeOutcome};

/// Per-tier usage accounting.
#[derive(Debug, Clone, Default)]
pub struct TierUsage {
    pub segment_count: usize,
    pub bytes_used: u64,
    pub capacity: u64,
}

impl TierUsage {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.bytes_used as f64 / self.capacity as f64
    }

    fn fits(&self, bytes: u64) -> bool {
        self.bytes_used + bytes <= self.capacity
    }

    fn add(&mut self, bytes: u64) {
        self.segment_count += 1;
        self.bytes_used += bytes;
    }

    fn remove(&mut self, bytes: u64) {
        self.segment_count = self.segment_count.saturating_sub(1);
        self.bytes_used = self.bytes_used.saturating_sub(bytes);
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing: HashSet<SegmentRef>,
    delay: Option<Duration>,
}

#[derive(Debug)]
struct SimState {
    segments: BTreeMap<SegmentRef, SegmentInfo>,
    /// Evicted segments kept for restore.
    evicted: HashMap<SegmentRef, SegmentInfo>,
    /// Pre-quantization (format, bytes), most recent last.
    quantized: HashMap<SegmentRef, Vec<(CacheFormat, u64)>>,
    tiers: HashMap<MemoryTier, TierUsage>,
    counters: CacheCounters,
    /// Accuracy lost to quantization, in percentage points.
    accuracy_delta_pct: f64,
    faults: Faults,
    /// Index used to name the next admitted segment.
    next_index: usize,
}

impl SimState {
    fn tier_mut(&mut self, tier: MemoryTier) -> &mut TierUsage {
        self.tiers.entry(tier).or_default()
    }

    fn tier(&self, tier: MemoryTier) -> TierUsage {
        self.tiers.get(&tier).cloned().unwrap_or_default()
    }
}

/// Shared simulated cache for a single namespace. Cloning shares the state.
#[derive(Clone)]
pub struct SimulatedCache {
    namespace: String,
    config: SimulationConfig,
    state: Arc<RwLock<SimState>>,
}

impl SimulatedCache {
    /// Build a cache seeded with `segment_count` FP16 segments in HBM.
    ///
    /// Segment `0` is the coldest; reuse rates cycle through 1..=5 so runs are
    /// reproducible.
    pub fn from_config(namespace: impl Into<String>, config: &SimulationConfig) -> Self {
        let namespace = namespace.into();
        let now = now_ms();
        let count = config.segment_count;
        let segments = (0..count)
            .map(|i| SegmentInfo {
                segment: SegmentRef::new(format!("{namespace}/seg-{i:04}")),
                tier: MemoryTier::Hbm,
                bytes: config.segment_bytes,
                format: CacheFormat::Fp16,
                last_access_ms: now.saturating_sub((count - i) as u64 * 60_000),
                reuse_rate: 1.0 + (i % 5) as f64,
                pinned: false,
            })
            .collect();
        Self::with_segments(namespace, config.clone(), segments)
    }

    /// Build a cache holding exactly `segments`.
    pub fn with_segments(
        namespace: impl Into<String>,
        config: SimulationConfig,
        segments: Vec<SegmentInfo>,
    ) -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            MemoryTier::Hbm,
            TierUsage {
                capacity: config.hbm_capacity_bytes,
                ..Default::default()
            },
        );
        tiers.insert(
            MemoryTier::Ddr,
            TierUsage {
                capacity: config.ddr_capacity_bytes,
                ..Default::default()
            },
        );

        let mut state = SimState {
            segments: BTreeMap::new(),
            evicted: HashMap::new(),
            quantized: HashMap::new(),
            tiers,
            counters: CacheCounters::default(),
            accuracy_delta_pct: 0.0,
            faults: Faults::default(),
            next_index: segments.len(),
        };
        for info in segments {
            state.tier_mut(info.tier).add(info.bytes);
            state.segments.insert(info.segment.clone(), info);
        }

        let namespace = namespace.into();
        info!(
            namespace = %namespace,
            segments = state.segments.len(),
            hbm_gib = to_gib(state.tier(MemoryTier::Hbm).bytes_used),
            "Simulated cache ready"
        );

        Self {
            namespace,
            config,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Make every future apply or revert on `segment` fail.
    pub async fn fail_segment(&self, segment: impl Into<SegmentRef>) {
        self.state.write().await.faults.failing.insert(segment.into());
    }

    pub async fn clear_faults(&self) {
        self.state.write().await.faults = Faults::default();
    }

    /// Delay every provider call by `delay`.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().await.faults.delay = delay;
    }

    /// Admit up to `count` new FP16 segments into HBM, as new requests would.
    /// Stops early when HBM is full. Returns how many were admitted.
    pub async fn admit(&self, count: usize) -> usize {
        let mut state = self.state.write().await;
        let now = now_ms();
        let mut admitted = 0;
        while admitted < count && state.tier(MemoryTier::Hbm).fits(self.config.segment_bytes) {
            let index = state.next_index;
            state.next_index += 1;
            let info = SegmentInfo {
                segment: SegmentRef::new(format!("{}/seg-{index:04}", self.namespace)),
                tier: MemoryTier::Hbm,
                bytes: self.config.segment_bytes,
                format: CacheFormat::Fp16,
                last_access_ms: now,
                reuse_rate: 1.0 + (index % 5) as f64,
                pinned: false,
            };
            state.tier_mut(MemoryTier::Hbm).add(info.bytes);
            state.segments.insert(info.segment.clone(), info);
            admitted += 1;
        }
        debug!(namespace = %self.namespace, admitted, "Admitted segments");
        admitted
    }

    pub async fn tier_usage(&self, tier: MemoryTier) -> TierUsage {
        self.state.read().await.tier(tier)
    }

    pub async fn segment(&self, segment: &SegmentRef) -> Option<SegmentInfo> {
        self.state.read().await.segments.get(segment).cloned()
    }

    /// P95 implied by the current HBM usage.
    fn p95_for(&self, hbm_used: u64) -> f64 {
        self.config.base_p95_ms + self.config.p95_ms_per_gib * to_gib(hbm_used)
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;
        let hbm = state.tier(MemoryTier::Hbm);
        let ddr = state.tier(MemoryTier::Ddr);
        MetricsSnapshot {
            namespace: self.namespace.clone(),
            captured_at_ms: now_ms(),
            hbm_used_bytes: hbm.bytes_used,
            hbm_capacity_bytes: hbm.capacity,
            ddr_used_bytes: ddr.bytes_used,
            ddr_capacity_bytes: ddr.capacity,
            p95_latency_ms: self.p95_for(hbm.bytes_used),
            ttft_ms: self.config.ttft_ms,
            accuracy_delta_pct: state.accuracy_delta_pct,
            counters: state.counters,
            segments: state.segments.values().cloned().collect(),
        }
    }

    /// Apply injected faults for a call on `segment`.
    async fn inject(&self, segment: &SegmentRef, operation: &str) -> Result<(), ProviderError> {
        let delay = {
            let state = self.state.read().await;
            if state.faults.failing.contains(segment) {
                return Err(ProviderError::Backend(format!(
                    "injected {operation} failure for {segment}"
                )));
            }
            state.faults.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn evict(&self, segment: &SegmentRef) -> Result<EvictOutcome, ProviderError> {
        self.inject(segment, "evict").await?;

        let mut state = self.state.write().await;
        let info = state
            .segments
            .remove(segment)
            .ok_or_else(|| ProviderError::SegmentNotFound(segment.clone()))?;

        state.tier_mut(info.tier).remove(info.bytes);
        state.counters.evicted += 1;
        state.counters.reuse_misses += info.reuse_rate.round() as u64;

        let freed_bytes = info.bytes;
        let restorable = self.config.retain_evicted;
        debug!(segment = %segment, tier = %info.tier, freed_bytes, restorable, "Evicted segment");
        if restorable {
            state.evicted.insert(segment.clone(), info);
        }
        Ok(EvictOutcome {
            freed_bytes,
            restorable,
        })
    }

    async fn restore(&self, segment: &SegmentRef) -> Result<(), ProviderError> {
        self.inject(segment, "restore").await?;

        let mut state = self.state.write().await;
        let info = state
            .evicted
            .remove(segment)
            .ok_or_else(|| ProviderError::NotReversible(segment.clone()))?;
        if !state.tier(info.tier).fits(info.bytes) {
            let tier = info.tier;
            state.evicted.insert(segment.clone(), info);
            return Err(ProviderError::Backend(format!(
                "{tier} has no room to restore {segment}"
            )));
        }

        state.tier_mut(info.tier).add(info.bytes);
        debug!(segment = %segment, tier = %info.tier, bytes = info.bytes, "Restored segment");
        state.segments.insert(segment.clone(), info);
        Ok(())
    }

    async fn quantize(&self, segment: &SegmentRef) -> Result<QuantizeOutcome, ProviderError> {
        self.inject(segment, "quantize").await?;

        let mut state = self.state.write().await;
        let info = state
            .segments
            .get(segment)
            .cloned()
            .ok_or_else(|| ProviderError::SegmentNotFound(segment.clone()))?;
        let next = info.format.quantized().ok_or_else(|| {
            ProviderError::Backend(format!("{segment} is already {}", info.format))
        })?;

        let new_bytes = info.format.resize(info.bytes, next);
        let freed_bytes = info.bytes.saturating_sub(new_bytes);
        let reversible = self.config.retain_quantized;

        state.tier_mut(info.tier).remove(info.bytes);
        state.tier_mut(info.tier).add(new_bytes);
        state.counters.quantized += 1;
        state.accuracy_delta_pct += self.config.accuracy.step_cost_pct(next);
        if reversible {
            state
                .quantized
                .entry(segment.clone())
                .or_default()
                .push((info.format, info.bytes));
        }
        if let Some(entry) = state.segments.get_mut(segment) {
            entry.format = next;
            entry.bytes = new_bytes;
        }

        debug!(segment = %segment, from = %info.format, to = %next, freed_bytes, "Quantized segment");
        Ok(QuantizeOutcome {
            freed_bytes,
            reversible,
        })
    }

    async fn dequantize(&self, segment: &SegmentRef) -> Result<(), ProviderError> {
        self.inject(segment, "dequantize").await?;

        let mut state = self.state.write().await;
        let (format, bytes) = state
            .quantized
            .get_mut(segment)
            .and_then(Vec::pop)
            .ok_or_else(|| ProviderError::NotReversible(segment.clone()))?;
        let info = state
            .segments
            .get(segment)
            .cloned()
            .ok_or_else(|| ProviderError::SegmentNotFound(segment.clone()))?;

        let grow = bytes.saturating_sub(info.bytes);
        if !state.tier(info.tier).fits(grow) {
            state
                .quantized
                .entry(segment.clone())
                .or_default()
                .push((format, bytes));
            return Err(ProviderError::Backend(format!(
                "{} has no room to dequantize {segment}",
                info.tier
            )));
        }

        state.tier_mut(info.tier).remove(info.bytes);
        state.tier_mut(info.tier).add(bytes);
        let recovered = self.config.accuracy.step_cost_pct(info.format);
        state.accuracy_delta_pct = (state.accuracy_delta_pct - recovered).max(0.0);
        if let Some(entry) = state.segments.get_mut(segment) {
            entry.format = format;
            entry.bytes = bytes;
        }
        debug!(segment = %segment, to = %format, "Dequantized segment");
        Ok(())
    }

    fn health(&self) -> HashMap<String, f64> {
        let mut metrics = HashMap::new();
        // Health is best effort; skip it rather than block on a writer.
        if let Ok(state) = self.state.try_read() {
            let hbm = state.tier(MemoryTier::Hbm);
            metrics.insert("hbm_utilization".to_string(), hbm.usage_fraction());
            metrics.insert("segments".to_string(), state.segments.len() as f64);
            metrics.insert("retained_evictions".to_string(), state.evicted.len() as f64);
            metrics.insert("p95_latency_ms".to_string(), self.p95_for(hbm.bytes_used));
        }
        metrics
    }
}

#[async_trait]
impl SnapshotProvider for SimulatedCache {
    async fn current_snapshot(&self, namespace: &str) -> Result<MetricsSnapshot, ProviderError> {
        if namespace != self.namespace {
            return Err(ProviderError::Backend(format!(
                "unknown namespace {namespace:?}"
            )));
        }
        Ok(self.snapshot().await)
    }
}

/// KV_CACHE provider backed by a [`SimulatedCache`].
pub struct SimulatedEvictor {
    name: String,
    cache: SimulatedCache,
}

impl SimulatedEvictor {
    pub const DEFAULT_NAME: &'static str = "sim-evictor";

    pub fn new(cache: SimulatedCache) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            cache,
        }
    }

    pub fn named(name: impl Into<String>, cache: SimulatedCache) -> Self {
        Self {
            name: name.into(),
            cache,
        }
    }
}

#[async_trait]
impl CapabilityProvider for SimulatedEvictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::KvCache
    }

    async fn on_startup(&self) -> Result<(), ProviderError> {
        info!(provider = %self.name, namespace = %self.cache.namespace(), "Evictor started");
        Ok(())
    }

    fn health_metrics(&self) -> HashMap<String, f64> {
        self.cache.health()
    }

    async fn evict(&self, segment: &SegmentRef) -> Result<EvictOutcome, ProviderError> {
        self.cache.evict(segment).await
    }

    async fn restore(&self, segment: &SegmentRef) -> Result<(), ProviderError> {
        self.cache.restore(segment).await
    }
}

/// QUANTIZATION provider backed by a [`SimulatedCache`].
pub struct SimulatedQuantizer {
    name: String,
    cache: SimulatedCache,
}

impl SimulatedQuantizer {
    pub const DEFAULT_NAME: &'static str = "sim-quantizer";

    pub fn new(cache: SimulatedCache) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            cache,
        }
    }
}

#[async_trait]
impl CapabilityProvider for SimulatedQuantizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Quantization
    }

    fn health_metrics(&self) -> HashMap<String, f64> {
        self.cache.health()
    }

    async fn quantize(&self, segment: &SegmentRef) -> Result<QuantizeOutcome, ProviderError> {
        self.cache.quantize(segment).await
    }

    async fn dequantize(&self, segment: &SegmentRef) -> Result<(), ProviderError> {
        self.cache.dequantize(segment).await
    }
}
