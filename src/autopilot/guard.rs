//! Guard system: the safety gate in front of and behind plan execution.
//!
//! Both checks are pure functions of the plan, two snapshots and the guard
//! configuration. The shadow check compares the current snapshot against a
//! projection of the plan's effect; the post check compares the snapshot
//! captured at plan creation against one observed after execution.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::autopilot::plan::Plan;
use crate::cache::segment::MemoryTier;
use crate::config::{Config, GuardConfig, LatencyModel};
use crate::metrics::snapshot::{now_ms, MetricsSnapshot};

pub mod metric {
    pub const P95_LATENCY: &str = "p95_latency_ms";
    pub const REUSE_MISSES: &str = "reuse_misses";
    pub const ACCURACY_DELTA: &str = "accuracy_delta_pct";
    pub const HBM_BYTES: &str = "hbm_bytes";
    pub const DDR_BYTES: &str = "ddr_bytes";
    pub const HBM_FREED: &str = "hbm_freed_bytes";
    pub const ACTIONS: &str = "actions";
    pub const TIMEOUT: &str = "timeout";
    pub const SNAPSHOT: &str = "snapshot";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Checkpoint {
    Shadow,
    Post,
}

/// One evaluated threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub metric: String,
    pub observed: f64,
    pub limit: f64,
    pub passed: bool,
}

impl ThresholdCheck {
    fn at_most(metric: &str, observed: f64, limit: f64) -> Self {
        Self {
            metric: metric.to_string(),
            observed,
            limit,
            passed: observed <= limit,
        }
    }

    fn at_least(metric: &str, observed: f64, limit: f64) -> Self {
        Self {
            metric: metric.to_string(),
            observed,
            limit,
            passed: observed >= limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictResult {
    Pass,
    Fail { metric: String },
}

/// Outcome of one guard checkpoint, attached to the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardVerdict {
    pub checkpoint: Checkpoint,
    pub before: MetricsSnapshot,
    /// Observed snapshot (post) or projected snapshot (shadow).
    pub after: MetricsSnapshot,
    pub checks: Vec<ThresholdCheck>,
    pub result: VerdictResult,
    pub evaluated_at_ms: u64,
}

impl GuardVerdict {
    fn from_checks(
        checkpoint: Checkpoint,
        before: MetricsSnapshot,
        after: MetricsSnapshot,
        checks: Vec<ThresholdCheck>,
    ) -> Self {
        let result = match checks.iter().find(|c| !c.passed) {
            Some(failed) => VerdictResult::Fail {
                metric: failed.metric.clone(),
            },
            None => VerdictResult::Pass,
        };
        Self {
            checkpoint,
            before,
            after,
            checks,
            result,
            evaluated_at_ms: now_ms(),
        }
    }

    /// A FAIL verdict for a checkpoint that could not be evaluated.
    pub fn unavailable(
        checkpoint: Checkpoint,
        before: &MetricsSnapshot,
        metric: &str,
        observed: f64,
        limit: f64,
    ) -> Self {
        Self::from_checks(
            checkpoint,
            before.clone(),
            before.clone(),
            vec![ThresholdCheck {
                metric: metric.to_string(),
                observed,
                limit,
                passed: false,
            }],
        )
    }

    pub fn is_pass(&self) -> bool {
        self.result == VerdictResult::Pass
    }

    /// The metric that failed, if any.
    pub fn breaching_metric(&self) -> Option<&str> {
        match &self.result {
            VerdictResult::Pass => None,
            VerdictResult::Fail { metric } => Some(metric),
        }
    }
}

pub struct Guard {
    config: GuardConfig,
    model: LatencyModel,
}

impl Guard {
    pub fn new(config: GuardConfig, model: LatencyModel) -> Self {
        Self { config, model }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.guard.clone(), config.latency_model)
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn common_checks(
        &self,
        before: &MetricsSnapshot,
        after: &MetricsSnapshot,
        miss_increase: f64,
    ) -> Vec<ThresholdCheck> {
        let mut checks = vec![
            ThresholdCheck::at_most(
                metric::P95_LATENCY,
                after.p95_latency_ms - before.p95_latency_ms,
                self.config.max_latency_regression_ms,
            ),
            ThresholdCheck::at_most(
                metric::REUSE_MISSES,
                miss_increase,
                self.config.max_reuse_miss_increase,
            ),
        ];
        for (tier, name) in [(MemoryTier::Hbm, metric::HBM_BYTES), (MemoryTier::Ddr, metric::DDR_BYTES)] {
            let capacity = after.capacity_bytes(tier);
            if capacity > 0 {
                checks.push(ThresholdCheck::at_most(
                    name,
                    after.used_bytes(tier) as f64,
                    capacity as f64,
                ));
            }
        }
        checks
    }

    fn accuracy_check(&self, before: &MetricsSnapshot, after: &MetricsSnapshot) -> ThresholdCheck {
        ThresholdCheck::at_most(
            metric::ACCURACY_DELTA,
            after.accuracy_delta_pct - before.accuracy_delta_pct,
            self.config.max_accuracy_delta_pct,
        )
    }

    fn log(&self, plan: &Plan, verdict: &GuardVerdict) {
        match verdict.breaching_metric() {
            None => info!(
                plan_id = %plan.id(),
                checkpoint = ?verdict.checkpoint,
                "Guard check passed"
            ),
            Some(metric) => warn!(
                plan_id = %plan.id(),
                checkpoint = ?verdict.checkpoint,
                metric,
                "Guard check failed"
            ),
        }
    }

    /// Project the plan onto `snapshot` without touching live state.
    pub fn project(&self, plan: &Plan, snapshot: &MetricsSnapshot) -> (MetricsSnapshot, f64) {
        let actions = plan.actions();
        let freed = |tier: MemoryTier| -> u64 {
            actions
                .iter()
                .filter(|a| a.tier == tier)
                .map(|a| a.expected_delta_bytes)
                .sum()
        };
        let freed_hbm = freed(MemoryTier::Hbm);
        let freed_ddr = freed(MemoryTier::Ddr);
        let misses: f64 = actions.iter().map(|a| a.projected_miss_increase).sum();
        let accuracy: f64 = actions.iter().map(|a| a.projected_accuracy_delta_pct).sum();

        let mut projected = snapshot.clone();
        projected.hbm_used_bytes = snapshot.hbm_used_bytes.saturating_sub(freed_hbm);
        projected.ddr_used_bytes = snapshot.ddr_used_bytes.saturating_sub(freed_ddr);
        projected.p95_latency_ms = self
            .model
            .project_p95(snapshot.p95_latency_ms, freed_hbm, misses);
        projected.counters.reuse_misses = snapshot.counters.reuse_misses + misses.ceil() as u64;
        projected.accuracy_delta_pct = snapshot.accuracy_delta_pct + accuracy;
        (projected, misses)
    }

    /// Evaluate the plan's projected effect on `snapshot`.
    pub fn shadow_check(&self, plan: &Plan, snapshot: &MetricsSnapshot) -> GuardVerdict {
        let (projected, misses) = self.project(plan, snapshot);
        let mut checks = vec![ThresholdCheck::at_least(
            metric::ACTIONS,
            plan.actions().len() as f64,
            1.0,
        )];
        checks.extend(self.common_checks(snapshot, &projected, misses));
        checks.push(self.accuracy_check(snapshot, &projected));

        let verdict = GuardVerdict::from_checks(Checkpoint::Shadow, snapshot.clone(), projected, checks);
        self.log(plan, &verdict);
        verdict
    }

    /// Evaluate observed deltas after (partial) execution.
    pub fn post_check(
        &self,
        plan: &Plan,
        before: &MetricsSnapshot,
        after: &MetricsSnapshot,
    ) -> GuardVerdict {
        let misses = after
            .counters
            .reuse_misses
            .saturating_sub(before.counters.reuse_misses) as f64;
        let mut checks = self.common_checks(before, after, misses);
        if self.config.rollback_on_accuracy_delta {
            checks.push(self.accuracy_check(before, after));
        }

        let target = plan.deficit().hbm_bytes;
        if !plan.is_best_effort() && target > 0 {
            let freed = before.hbm_used_bytes.saturating_sub(after.hbm_used_bytes);
            checks.push(ThresholdCheck::at_least(
                metric::HBM_FREED,
                freed as f64,
                target as f64 * (1.0 - self.config.deficit_tolerance),
            ));
        }

        let verdict =
            GuardVerdict::from_checks(Checkpoint::Post, before.clone(), after.clone(), checks);
        self.log(plan, &verdict);
        verdict
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::autopilot::plan::{Action, ActionKind, Deficit, PlanDraft};
    use crate::cache::segment::SegmentRef;
    use crate::config::RiskBudget;
    use crate::metrics::snapshot::{gib, CacheCounters};

    fn snapshot(hbm: f64, p95: f64, misses: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            namespace: "ns".into(),
            captured_at_ms: 0,
            hbm_used_bytes: gib(hbm),
            hbm_capacity_bytes: gib(16.0),
            ddr_used_bytes: 0,
            ddr_capacity_bytes: gib(64.0),
            p95_latency_ms: p95,
            ttft_ms: 100.0,
            accuracy_delta_pct: 0.0,
            counters: CacheCounters {
                reuse_misses: misses,
                ..Default::default()
            },
            segments: Arc::from(Vec::new()),
        }
    }

    fn plan(actions: Vec<(u64, f64)>, best_effort: bool) -> Plan {
        plan_with(
            actions
                .into_iter()
                .enumerate()
                .map(|(i, (bytes, misses))| Action {
                    kind: ActionKind::Evict,
                    segment: SegmentRef::new(format!("s{i}")),
                    tier: MemoryTier::Hbm,
                    expected_delta_bytes: bytes,
                    projected_miss_increase: misses,
                    projected_accuracy_delta_pct: 0.0,
                })
                .collect(),
            best_effort,
        )
    }

    fn plan_with(actions: Vec<Action>, best_effort: bool) -> Plan {
        let draft = PlanDraft {
            actions,
            deficit: Deficit {
                hbm_bytes: gib(1.5),
                ..Default::default()
            },
            risk_budget: RiskBudget::default(),
            best_effort,
        };
        Plan::from_draft(draft, Arc::new(snapshot(12.5, 2100.0, 0)))
    }

    fn guard() -> Guard {
        Guard::from_config(&Config::default())
    }

    #[test]
    fn test_shadow_pass_projects_memory_and_latency() {
        let p = plan(vec![(gib(1.0), 1.0), (gib(0.5), 1.0)], false);
        let verdict = guard().shadow_check(&p, &snapshot(12.5, 2100.0, 0));
        assert!(verdict.is_pass(), "{verdict:?}");
        assert_eq!(verdict.after.hbm_used_bytes, gib(11.0));
        // 2100 - 1.5 × 200 + 2 × 2
        assert!((verdict.after.p95_latency_ms - 1804.0).abs() < 1e-6);
    }

    #[test]
    fn test_shadow_fails_on_projected_misses() {
        // Latency model off so the miss check is the only breach.
        let mut config = Config::default();
        config.latency_model.miss_penalty_ms = 0.0;
        let guard = Guard::from_config(&config);

        let p = plan(vec![(gib(0.1), 80.0)], false);
        let verdict = guard.shadow_check(&p, &snapshot(12.5, 2100.0, 0));
        assert_eq!(verdict.breaching_metric(), Some(metric::REUSE_MISSES));
        let misses = verdict
            .checks
            .iter()
            .find(|c| c.metric == metric::REUSE_MISSES)
            .unwrap();
        assert_eq!(misses.observed, 80.0);
        assert!(!misses.passed);
    }

    #[test]
    fn test_shadow_fails_on_projected_accuracy_loss() {
        let quantize = |i: usize, pct: f64| Action {
            kind: ActionKind::Quantize,
            segment: SegmentRef::new(format!("q{i}")),
            tier: MemoryTier::Hbm,
            expected_delta_bytes: gib(0.5),
            projected_miss_increase: 0.1,
            projected_accuracy_delta_pct: pct,
        };
        let p = plan_with(vec![quantize(0, 0.1), quantize(1, 0.1)], false);
        let verdict = guard().shadow_check(&p, &snapshot(12.5, 2100.0, 0));
        assert!(verdict.is_pass(), "{verdict:?}");
        assert!((verdict.after.accuracy_delta_pct - 0.2).abs() < 1e-9);

        let p = plan_with((0..6).map(|i| quantize(i, 0.1)).collect(), false);
        let verdict = guard().shadow_check(&p, &snapshot(12.5, 2100.0, 0));
        assert_eq!(verdict.breaching_metric(), Some(metric::ACCURACY_DELTA));
    }

    #[test]
    fn test_post_check_observed_accuracy_drift() {
        let p = plan(vec![(gib(1.5), 1.0)], false);
        let before = snapshot(12.5, 2100.0, 0);
        let mut after = snapshot(11.0, 1800.0, 0);
        after.accuracy_delta_pct = 0.8;

        let verdict = guard().post_check(&p, &before, &after);
        assert_eq!(verdict.breaching_metric(), Some(metric::ACCURACY_DELTA));

        // Observed drift is ignored when rollback on accuracy is off.
        let mut config = Config::default();
        config.guard.rollback_on_accuracy_delta = false;
        let verdict = Guard::from_config(&config).post_check(&p, &before, &after);
        assert!(verdict.is_pass(), "{verdict:?}");
    }

    #[test]
    fn test_shadow_rejects_empty_plan() {
        let p = plan(vec![], true);
        let verdict = guard().shadow_check(&p, &snapshot(12.5, 2100.0, 0));
        assert_eq!(verdict.breaching_metric(), Some(metric::ACTIONS));
    }

    #[test]
    fn test_shadow_fails_on_hbm_overflow() {
        let p = plan(vec![(gib(0.5), 0.0)], true);
        let verdict = guard().shadow_check(&p, &snapshot(17.0, 1000.0, 0));
        assert_eq!(verdict.breaching_metric(), Some(metric::HBM_BYTES));
    }

    #[test]
    fn test_post_check_latency_regression() {
        let p = plan(vec![(gib(1.5), 1.0)], false);
        let verdict = guard().post_check(&p, &snapshot(12.5, 2100.0, 0), &snapshot(11.0, 2300.0, 0));
        assert_eq!(verdict.breaching_metric(), Some(metric::P95_LATENCY));
        let check = &verdict.checks[0];
        assert_eq!(check.observed, 200.0);
        assert!(!check.passed);
    }

    #[test]
    fn test_post_check_counts_observed_misses() {
        let p = plan(vec![(gib(1.5), 1.0)], false);
        let verdict = guard().post_check(&p, &snapshot(12.5, 2100.0, 10), &snapshot(11.0, 1800.0, 70));
        assert_eq!(verdict.breaching_metric(), Some(metric::REUSE_MISSES));
    }

    #[test]
    fn test_post_check_deficit_shortfall() {
        let p = plan(vec![(gib(1.5), 1.0)], false);
        let verdict = guard().post_check(&p, &snapshot(12.5, 2100.0, 0), &snapshot(12.0, 1900.0, 0));
        assert_eq!(verdict.breaching_metric(), Some(metric::HBM_FREED));

        // Best-effort plans are not held to the deficit.
        let p = plan(vec![(gib(1.5), 1.0)], true);
        let verdict = guard().post_check(&p, &snapshot(12.5, 2100.0, 0), &snapshot(12.0, 1900.0, 0));
        assert!(verdict.is_pass());
    }

    #[test]
    fn test_unavailable_verdict_fails() {
        let before = snapshot(12.5, 2100.0, 0);
        let verdict = GuardVerdict::unavailable(Checkpoint::Post, &before, metric::TIMEOUT, 5000.0, 5000.0);
        assert!(!verdict.is_pass());
        assert_eq!(verdict.breaching_metric(), Some(metric::TIMEOUT));
    }
}
