//! Policy engine: turns a metrics snapshot into a candidate plan.
//!
//! Every eligible segment yields up to two candidates (EVICT, and QUANTIZE
//! if the format can shrink further). Candidates are ranked by
//!
//! ```text
//! score(candidate) = freed_bytes / (weight(kind) × projected_miss_increase + ε)
//! projected_miss_increase = reuse_rate × miss_factor(kind)
//! ```
//!
//! and picked greedily until the deficit is closed. QUANTIZE candidates also
//! carry the accuracy cost of their format step, which counts against the
//! risk budget. The engine is a pure function of snapshot and config.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use tracing::debug;

use crate::autopilot::plan::{Action, ActionKind, Deficit, PlanDraft};
use crate::cache::segment::{MemoryTier, SegmentInfo};
use crate::config::{AccuracyModel, Config, LatencyModel, PolicyConfig};
use crate::metrics::snapshot::MetricsSnapshot;

/// Keeps zero-reuse segments from dividing by zero.
const COST_FLOOR: f64 = 1e-6;

/// Result of a policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    /// Occupancy and latency are within target.
    NoActionNeeded,
    Plan(PlanDraft),
}

/// A ranked action candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub action: Action,
    pub score: f64,
    /// `weight(kind) × projected_miss_increase`.
    pub weighted_cost: f64,
    pub last_access_ms: u64,
}

// Higher score = picked first. Ties: lower impact, then colder, then segment id.
impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                other
                    .weighted_cost
                    .partial_cmp(&self.weighted_cost)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| other.last_access_ms.cmp(&self.last_access_ms))
            .then_with(|| other.action.segment.cmp(&self.action.segment))
            .then_with(|| kind_rank(self.action.kind).cmp(&kind_rank(other.action.kind)))
    }
}

/// QUANTIZE outranks EVICT when everything else is equal.
fn kind_rank(kind: ActionKind) -> u8 {
    match kind {
        ActionKind::Quantize => 1,
        ActionKind::Evict => 0,
    }
}

/// Bytes still to free per tier while building a draft.
#[derive(Debug, Clone, Copy)]
struct Remaining {
    hbm: u64,
    ddr: u64,
}

impl Remaining {
    fn get(&self, tier: MemoryTier) -> u64 {
        match tier {
            MemoryTier::Hbm => self.hbm,
            MemoryTier::Ddr => self.ddr,
        }
    }

    fn take(&mut self, tier: MemoryTier, bytes: u64) {
        match tier {
            MemoryTier::Hbm => self.hbm = self.hbm.saturating_sub(bytes),
            MemoryTier::Ddr => self.ddr = self.ddr.saturating_sub(bytes),
        }
    }

    fn is_closed(&self) -> bool {
        self.hbm == 0 && self.ddr == 0
    }
}

/// Running totals of the actions picked so far.
#[derive(Debug, Default)]
struct Selection {
    actions: Vec<Action>,
    segments: HashSet<String>,
    misses: f64,
    accuracy_pct: f64,
    freed_hbm: u64,
}

pub struct PolicyEngine {
    config: PolicyConfig,
    model: LatencyModel,
    accuracy: AccuracyModel,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig, model: LatencyModel, accuracy: AccuracyModel) -> Self {
        Self {
            config,
            model,
            accuracy,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.policy.clone(),
            config.latency_model,
            config.accuracy_model,
        )
    }

    /// How far the snapshot is from target.
    pub fn deficit(&self, snapshot: &MetricsSnapshot) -> Deficit {
        let hbm_excess = snapshot
            .hbm_used_bytes
            .saturating_sub(self.config.hbm_target_bytes);
        let latency_ms = (snapshot.p95_latency_ms - self.config.sla_p95_ms).max(0.0);
        let latency_bytes = self.model.bytes_for_latency(latency_ms);
        let ddr_bytes = self
            .config
            .ddr_target_bytes
            .map(|target| snapshot.ddr_used_bytes.saturating_sub(target))
            .unwrap_or(0);

        Deficit {
            hbm_bytes: hbm_excess.max(latency_bytes),
            ddr_bytes,
            latency_ms,
        }
    }

    fn miss_factor(&self, kind: ActionKind) -> f64 {
        match kind {
            ActionKind::Evict => 1.0,
            ActionKind::Quantize => self.config.quantize_miss_factor,
        }
    }

    fn weight(&self, kind: ActionKind) -> f64 {
        match kind {
            ActionKind::Evict => self.config.evict_weight,
            ActionKind::Quantize => self.config.quantize_weight,
        }
    }

    fn candidate(&self, segment: &SegmentInfo, kind: ActionKind, freed: u64) -> Candidate {
        let misses = segment.reuse_rate.max(0.0) * self.miss_factor(kind);
        let weighted_cost = self.weight(kind) * misses;
        let accuracy = match kind {
            ActionKind::Evict => 0.0,
            ActionKind::Quantize => segment
                .format
                .quantized()
                .map_or(0.0, |next| self.accuracy.step_cost_pct(next)),
        };
        Candidate {
            action: Action {
                kind,
                segment: segment.segment.clone(),
                tier: segment.tier,
                expected_delta_bytes: freed,
                projected_miss_increase: misses,
                projected_accuracy_delta_pct: accuracy,
            },
            score: freed as f64 / (weighted_cost + COST_FLOOR),
            weighted_cost,
            last_access_ms: segment.last_access_ms,
        }
    }

    /// All eligible candidates for the tiers in deficit, best first.
    pub fn candidates(&self, snapshot: &MetricsSnapshot, deficit: &Deficit) -> Vec<Candidate> {
        let mut heap = BinaryHeap::new();

        for segment in snapshot.segments.iter() {
            if segment.pinned || segment.bytes == 0 {
                continue;
            }
            if deficit.bytes(segment.tier) == 0 {
                continue;
            }
            if segment.age_ms(snapshot.captured_at_ms) < self.config.protect_recent_ms {
                continue;
            }

            heap.push(self.candidate(segment, ActionKind::Evict, segment.bytes));
            if let Some(savings) = segment.quantize_savings().filter(|s| *s > 0) {
                heap.push(self.candidate(segment, ActionKind::Quantize, savings));
            }
        }

        heap.into_sorted_vec().into_iter().rev().collect()
    }

    fn within_budget(&self, snapshot: &MetricsSnapshot, selection: &Selection, c: &Candidate) -> bool {
        let budget = &self.config.risk_budget;
        let misses = selection.misses + c.action.projected_miss_increase;
        if misses > budget.max_reuse_miss_increase {
            return false;
        }
        if selection.accuracy_pct + c.action.projected_accuracy_delta_pct
            > budget.max_accuracy_delta_pct
        {
            return false;
        }
        let freed_hbm = selection.freed_hbm
            + match c.action.tier {
                MemoryTier::Hbm => c.action.expected_delta_bytes,
                MemoryTier::Ddr => 0,
            };
        let projected = self
            .model
            .project_p95(snapshot.p95_latency_ms, freed_hbm, misses);
        projected - snapshot.p95_latency_ms <= budget.max_latency_regression_ms
    }

    /// Take candidates in order until the deficit closes. Returns the ones skipped for budget.
    fn select(
        &self,
        snapshot: &MetricsSnapshot,
        candidates: Vec<Candidate>,
        selection: &mut Selection,
        remaining: &mut Remaining,
        enforce_budget: bool,
    ) -> Vec<Candidate> {
        let mut over_budget = Vec::new();
        for c in candidates {
            if remaining.is_closed() || selection.actions.len() >= self.config.max_actions {
                break;
            }
            if remaining.get(c.action.tier) == 0 {
                continue;
            }
            if selection.segments.contains(c.action.segment.as_str()) {
                continue;
            }
            if enforce_budget && !self.within_budget(snapshot, selection, &c) {
                over_budget.push(c);
                continue;
            }

            remaining.take(c.action.tier, c.action.expected_delta_bytes);
            selection.misses += c.action.projected_miss_increase;
            selection.accuracy_pct += c.action.projected_accuracy_delta_pct;
            if c.action.tier == MemoryTier::Hbm {
                selection.freed_hbm += c.action.expected_delta_bytes;
            }
            selection.segments.insert(c.action.segment.0.clone());
            selection.actions.push(c.action);
        }
        over_budget
    }

    /// Propose a plan for the snapshot, or report that none is needed.
    pub fn propose(&self, snapshot: &MetricsSnapshot) -> Proposal {
        let deficit = self.deficit(snapshot);
        if deficit.is_empty() {
            return Proposal::NoActionNeeded;
        }

        let candidates = self.candidates(snapshot, &deficit);
        let considered = candidates.len();
        let mut remaining = Remaining {
            hbm: deficit.hbm_bytes,
            ddr: deficit.ddr_bytes,
        };
        let mut selection = Selection::default();

        let over_budget = self.select(snapshot, candidates, &mut selection, &mut remaining, true);

        let mut best_effort = false;
        if !remaining.is_closed() {
            // The guard decides whether an over-budget plan may run.
            best_effort = true;
            self.select(snapshot, over_budget, &mut selection, &mut remaining, false);
        }

        debug!(
            namespace = %snapshot.namespace,
            hbm_deficit = deficit.hbm_bytes,
            ddr_deficit = deficit.ddr_bytes,
            latency_excess_ms = deficit.latency_ms,
            candidates = considered,
            actions = selection.actions.len(),
            best_effort,
            "Policy proposal"
        );

        Proposal::Plan(PlanDraft {
            actions: selection.actions,
            deficit,
            risk_budget: self.config.risk_budget,
            best_effort,
        })
    }
}

/// Convenience wrapper over [`PolicyEngine::propose`].
pub fn propose(snapshot: &MetricsSnapshot, config: &Config) -> Proposal {
    PolicyEngine::from_config(config).propose(snapshot)
}
