//! Plan, Action and the plan status state machine.
//!
//! A plan's action sequence is fixed at creation (`Arc<[Action]>`); only the
//! status, per-action execution records, guard verdicts and rollback result
//! change over its lifetime. Every mutation goes through a method that
//! enforces the allowed transitions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::autopilot::executor::RevertResult;
use crate::autopilot::guard::GuardVerdict;
use crate::cache::segment::{MemoryTier, SegmentRef};
use crate::config::RiskBudget;
use crate::metrics::snapshot::{now_ms, MetricsSnapshot};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Invalid plan transition {from} -> {to}")]
    InvalidTransition { from: PlanStatus, to: PlanStatus },

    #[error("Invalid outcome transition for action {index}: {from} -> {to}")]
    InvalidOutcome {
        index: usize,
        from: ActionOutcome,
        to: ActionOutcome,
    },

    #[error("Plan has no action at index {0}")]
    NoSuchAction(usize),
}

/// Unique, opaque plan identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PlanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Evict,
    Quantize,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Evict => write!(f, "EVICT"),
            ActionKind::Quantize => write!(f, "QUANTIZE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionOutcome {
    Pending,
    Applied,
    Failed,
    Reverted,
}

impl ActionOutcome {
    /// Outcomes only move forward; REVERTED is reachable only from APPLIED.
    pub fn can_advance_to(&self, next: ActionOutcome) -> bool {
        matches!(
            (self, next),
            (ActionOutcome::Pending, ActionOutcome::Applied)
                | (ActionOutcome::Pending, ActionOutcome::Failed)
                | (ActionOutcome::Applied, ActionOutcome::Reverted)
        )
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Pending => write!(f, "PENDING"),
            ActionOutcome::Applied => write!(f, "APPLIED"),
            ActionOutcome::Failed => write!(f, "FAILED"),
            ActionOutcome::Reverted => write!(f, "REVERTED"),
        }
    }
}

/// One planned change against a single segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub segment: SegmentRef,
    pub tier: MemoryTier,

    /// Bytes the policy expects this action to free.
    pub expected_delta_bytes: u64,

    /// Reuse misses per window the policy expects this action to add.
    pub projected_miss_increase: f64,

    /// Accuracy loss (percentage points) the policy expects; zero for evictions.
    #[serde(default)]
    pub projected_accuracy_delta_pct: f64,
}

/// Execution state of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub outcome: ActionOutcome,

    /// Bytes the provider reported freed.
    pub freed_bytes: Option<u64>,

    /// Whether the provider can undo the change.
    pub reversible: Option<bool>,

    pub error: Option<String>,

    /// Set when reverting this action failed.
    pub revert_error: Option<String>,
}

impl ActionRecord {
    fn pending() -> Self {
        Self {
            outcome: ActionOutcome::Pending,
            freed_bytes: None,
            reversible: None,
            error: None,
            revert_error: None,
        }
    }
}

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Created,
    ShadowChecking,
    ShadowPass,
    ShadowFail,
    Rejected,
    Applying,
    PostChecking,
    PostPass,
    PostFail,
    Applied,
    RollingBack,
    RolledBack,
    RolledBackPartial,
    Cancelled,
    /// Shadow check passed on a dry-run plan; nothing was applied.
    DryRun,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Applied
                | PlanStatus::Rejected
                | PlanStatus::RolledBack
                | PlanStatus::RolledBackPartial
                | PlanStatus::Cancelled
                | PlanStatus::DryRun
        )
    }

    /// States in which a cancellation request will still be honored.
    ///
    /// SHADOW_PASS is included because the flag is observed before the
    /// first action of APPLYING.
    pub fn accepts_cancel(&self) -> bool {
        matches!(
            self,
            PlanStatus::Created
                | PlanStatus::ShadowChecking
                | PlanStatus::ShadowPass
                | PlanStatus::Applying
        )
    }

    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Created, ShadowChecking)
                | (Created, Cancelled)
                | (ShadowChecking, ShadowPass)
                | (ShadowChecking, ShadowFail)
                | (ShadowChecking, Cancelled)
                | (ShadowFail, Rejected)
                | (ShadowPass, Applying)
                | (ShadowPass, DryRun)
                | (ShadowPass, Cancelled)
                | (Applying, PostChecking)
                | (Applying, RollingBack)
                | (Applying, Cancelled)
                | (PostChecking, PostPass)
                | (PostChecking, PostFail)
                | (PostPass, Applied)
                | (PostFail, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RolledBackPartial)
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Created => "CREATED",
            PlanStatus::ShadowChecking => "SHADOW_CHECKING",
            PlanStatus::ShadowPass => "SHADOW_PASS",
            PlanStatus::ShadowFail => "SHADOW_FAIL",
            PlanStatus::Rejected => "REJECTED",
            PlanStatus::Applying => "APPLYING",
            PlanStatus::PostChecking => "POST_CHECKING",
            PlanStatus::PostPass => "POST_PASS",
            PlanStatus::PostFail => "POST_FAIL",
            PlanStatus::Applied => "APPLIED",
            PlanStatus::RollingBack => "ROLLING_BACK",
            PlanStatus::RolledBack => "ROLLED_BACK",
            PlanStatus::RolledBackPartial => "ROLLED_BACK_PARTIAL",
            PlanStatus::Cancelled => "CANCELLED",
            PlanStatus::DryRun => "DRY_RUN",
        };
        f.write_str(s)
    }
}

/// What a plan set out to fix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Deficit {
    /// HBM bytes to free (memory excess or latency excess, whichever is larger).
    pub hbm_bytes: u64,

    /// DDR bytes to free.
    pub ddr_bytes: u64,

    /// P95 excess over the SLA, in ms.
    pub latency_ms: f64,
}

impl Deficit {
    pub fn is_empty(&self) -> bool {
        self.hbm_bytes == 0 && self.ddr_bytes == 0 && self.latency_ms <= 0.0
    }

    /// Bytes to free in the given tier.
    pub fn bytes(&self, tier: MemoryTier) -> u64 {
        match tier {
            MemoryTier::Hbm => self.hbm_bytes,
            MemoryTier::Ddr => self.ddr_bytes,
        }
    }
}

/// Policy output before the controller turns it into a tracked [`Plan`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDraft {
    pub actions: Vec<Action>,
    pub deficit: Deficit,
    pub risk_budget: RiskBudget,

    /// Set when the deficit could not be closed within the risk budget.
    pub best_effort: bool,
}

impl PlanDraft {
    /// Total bytes the draft expects to free in a tier.
    pub fn expected_freed(&self, tier: MemoryTier) -> u64 {
        self.actions
            .iter()
            .filter(|a| a.tier == tier)
            .map(|a| a.expected_delta_bytes)
            .sum()
    }
}

/// A tracked optimization plan.
#[derive(Debug, Clone)]
pub struct Plan {
    id: PlanId,
    namespace: String,
    status: PlanStatus,
    actions: Arc<[Action]>,
    records: Vec<ActionRecord>,
    created_at_ms: u64,
    snapshot: Arc<MetricsSnapshot>,
    verdicts: Vec<GuardVerdict>,
    risk_budget: RiskBudget,
    deficit: Deficit,
    best_effort: bool,
    dry_run: bool,
    rollback: Option<RevertResult>,
    failure: Option<String>,
}

impl Plan {
    /// Create a plan in CREATED state from a policy draft and the snapshot it was built from.
    pub fn from_draft(draft: PlanDraft, snapshot: Arc<MetricsSnapshot>) -> Self {
        let records = vec![ActionRecord::pending(); draft.actions.len()];
        Self {
            id: PlanId::new(),
            namespace: snapshot.namespace.clone(),
            status: PlanStatus::Created,
            actions: Arc::from(draft.actions),
            records,
            created_at_ms: now_ms(),
            snapshot,
            verdicts: Vec::new(),
            risk_budget: draft.risk_budget,
            deficit: draft.deficit,
            best_effort: draft.best_effort,
            dry_run: false,
            rollback: None,
            failure: None,
        }
    }

    /// Mark the plan as a dry run: it stops after the shadow check.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn id(&self) -> PlanId {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    /// The immutable action sequence.
    pub fn actions(&self) -> Arc<[Action]> {
        self.actions.clone()
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn snapshot(&self) -> &Arc<MetricsSnapshot> {
        &self.snapshot
    }

    pub fn verdicts(&self) -> &[GuardVerdict] {
        &self.verdicts
    }

    pub fn risk_budget(&self) -> RiskBudget {
        self.risk_budget
    }

    pub fn deficit(&self) -> Deficit {
        self.deficit
    }

    pub fn is_best_effort(&self) -> bool {
        self.best_effort
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn rollback(&self) -> Option<&RevertResult> {
        self.rollback.as_ref()
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: PlanStatus) -> Result<PlanStatus, PlanError> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(PlanError::InvalidTransition { from, to: next });
        }
        self.status = next;
        info!(
            plan_id = %self.id,
            namespace = %self.namespace,
            from = %from,
            to = %next,
            "Plan state transition"
        );
        Ok(from)
    }

    /// Jump to a terminal status after an internal lifecycle error.
    pub fn abort(&mut self, terminal: PlanStatus, failure: String) {
        warn!(
            plan_id = %self.id,
            namespace = %self.namespace,
            from = %self.status,
            to = %terminal,
            failure = %failure,
            "Plan aborted"
        );
        self.status = terminal;
        self.failure = Some(failure);
    }

    /// Append a guard verdict. Verdicts are never removed.
    pub fn record_verdict(&mut self, verdict: GuardVerdict) {
        self.verdicts.push(verdict);
    }

    fn advance(&mut self, index: usize, next: ActionOutcome) -> Result<&mut ActionRecord, PlanError> {
        let record = self
            .records
            .get_mut(index)
            .ok_or(PlanError::NoSuchAction(index))?;
        if !record.outcome.can_advance_to(next) {
            return Err(PlanError::InvalidOutcome {
                index,
                from: record.outcome,
                to: next,
            });
        }
        record.outcome = next;
        Ok(record)
    }

    pub fn mark_applied(
        &mut self,
        index: usize,
        freed_bytes: u64,
        reversible: bool,
    ) -> Result<(), PlanError> {
        let record = self.advance(index, ActionOutcome::Applied)?;
        record.freed_bytes = Some(freed_bytes);
        record.reversible = Some(reversible);
        Ok(())
    }

    pub fn mark_failed(&mut self, index: usize, error: String) -> Result<(), PlanError> {
        let record = self.advance(index, ActionOutcome::Failed)?;
        record.error = Some(error);
        Ok(())
    }

    pub fn mark_reverted(&mut self, index: usize) -> Result<(), PlanError> {
        self.advance(index, ActionOutcome::Reverted).map(|_| ())
    }

    /// Record a failed revert. The action stays APPLIED.
    pub fn mark_revert_failed(&mut self, index: usize, reason: String) -> Result<(), PlanError> {
        let record = self
            .records
            .get_mut(index)
            .ok_or(PlanError::NoSuchAction(index))?;
        record.revert_error = Some(reason);
        Ok(())
    }

    /// Indices of actions currently APPLIED, in plan order.
    pub fn applied_indices(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.outcome == ActionOutcome::Applied)
            .map(|(i, _)| i)
            .collect()
    }

    /// Bytes freed by actions that are still APPLIED.
    pub fn freed_bytes(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| r.outcome == ActionOutcome::Applied)
            .filter_map(|r| r.freed_bytes)
            .sum()
    }

    pub fn set_rollback(&mut self, result: RevertResult) {
        self.rollback = Some(result);
    }

    pub fn set_failure(&mut self, failure: impl Into<String>) {
        self.failure = Some(failure.into());
    }

    /// Serializable view for callers outside the controller.
    pub fn view(&self) -> PlanView {
        PlanView {
            id: self.id,
            namespace: self.namespace.clone(),
            status: self.status,
            created_at_ms: self.created_at_ms,
            best_effort: self.best_effort,
            dry_run: self.dry_run,
            deficit: self.deficit,
            risk_budget: self.risk_budget,
            freed_bytes: self.freed_bytes(),
            actions: self
                .actions
                .iter()
                .zip(&self.records)
                .map(|(action, record)| ActionView {
                    action: action.clone(),
                    record: record.clone(),
                })
                .collect(),
            verdicts: self.verdicts.clone(),
            rollback: self.rollback.clone(),
            failure: self.failure.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionView {
    #[serde(flatten)]
    pub action: Action,
    #[serde(flatten)]
    pub record: ActionRecord,
}

/// Read-only projection of a plan, as returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanView {
    pub id: PlanId,
    pub namespace: String,
    pub status: PlanStatus,
    pub created_at_ms: u64,
    pub best_effort: bool,
    pub dry_run: bool,
    pub deficit: Deficit,
    pub risk_budget: RiskBudget,
    pub freed_bytes: u64,
    pub actions: Vec<ActionView>,
    pub verdicts: Vec<GuardVerdict>,
    pub rollback: Option<RevertResult>,
    pub failure: Option<String>,
}

impl PlanView {
    /// Outcomes of every action, in plan order.
    pub fn outcomes(&self) -> Vec<ActionOutcome> {
        self.actions.iter().map(|a| a.record.outcome).collect()
    }
}
