//! Shared handle to a plan owned by the controller.
//!
//! The plan itself sits behind a tokio `RwLock`; the current status is
//! mirrored into a `watch` channel so callers can read it without locking
//! and await terminal states. Cancellation is a flag observed by the
//! lifecycle at action boundaries.
//!
//! A cancel request and any transition out of a cancellable status are
//! serialized on the plan lock: either the transition sees the flag and
//! yields, or the request sees the new status and is refused.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{watch, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::autopilot::plan::{Plan, PlanError, PlanId, PlanStatus};

/// Result of [`PlanHandle::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The transition happened; carries the previous status.
    Moved(PlanStatus),
    /// A cancellation was pending; the status is unchanged.
    Cancelled,
}

pub struct PlanHandle {
    id: PlanId,
    namespace: String,
    plan: RwLock<Plan>,
    cancel: AtomicBool,
    status: watch::Sender<PlanStatus>,
}

impl PlanHandle {
    pub fn new(plan: Plan) -> Self {
        let (status, _) = watch::channel(plan.status());
        Self {
            id: plan.id(),
            namespace: plan.namespace().to_string(),
            plan: RwLock::new(plan),
            cancel: AtomicBool::new(false),
            status,
        }
    }

    pub fn id(&self) -> PlanId {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Plan> {
        self.plan.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Plan> {
        self.plan.write().await
    }

    /// Latest published status, without locking the plan.
    pub fn status(&self) -> PlanStatus {
        *self.status.borrow()
    }

    /// Transition the plan and publish the new status.
    pub async fn transition(&self, next: PlanStatus) -> Result<PlanStatus, PlanError> {
        self.transition_with(next, |_| {}).await
    }

    /// Transition the plan and run `on_commit` under the same write lock.
    ///
    /// Used to make counter increments atomic with terminal transitions.
    pub async fn transition_with(
        &self,
        next: PlanStatus,
        on_commit: impl FnOnce(&Plan),
    ) -> Result<PlanStatus, PlanError> {
        let mut plan = self.plan.write().await;
        let from = plan.transition(next)?;
        on_commit(&plan);
        self.status.send_replace(next);
        Ok(from)
    }

    /// Transition unless a cancellation is pending and the current status
    /// still honors it.
    pub async fn advance(&self, next: PlanStatus) -> Result<Advance, PlanError> {
        self.advance_with(next, |_| {}).await
    }

    /// [`advance`](Self::advance), running `on_commit` only if the plan moved.
    pub async fn advance_with(
        &self,
        next: PlanStatus,
        on_commit: impl FnOnce(&Plan),
    ) -> Result<Advance, PlanError> {
        let mut plan = self.plan.write().await;
        if self.cancel_requested() && plan.status().accepts_cancel() {
            return Ok(Advance::Cancelled);
        }
        let from = plan.transition(next)?;
        on_commit(&plan);
        self.status.send_replace(next);
        Ok(Advance::Moved(from))
    }

    /// Force a terminal status outside the transition table.
    ///
    /// Only for lifecycles that hit an internal error; no-op if the plan is
    /// already terminal. Returns true if the status changed.
    pub async fn abort(
        &self,
        terminal: PlanStatus,
        failure: String,
        on_commit: impl FnOnce(&Plan),
    ) -> bool {
        let mut plan = self.plan.write().await;
        if plan.status().is_terminal() {
            return false;
        }
        plan.abort(terminal, failure);
        on_commit(&plan);
        self.status.send_replace(plan.status());
        true
    }

    /// Flag the plan for cancellation. Returns false if it was already flagged.
    pub fn request_cancel(&self) -> bool {
        !self.cancel.swap(true, Ordering::SeqCst)
    }

    /// Flag the plan for cancellation if its current status allows it.
    ///
    /// Holds the plan lock, so no transition can slip between the status
    /// check and the flag. Returns the status that refused the request.
    pub async fn try_cancel(&self) -> Result<bool, PlanStatus> {
        let plan = self.plan.write().await;
        let status = plan.status();
        if !status.accepts_cancel() {
            return Err(status);
        }
        Ok(self.request_cancel())
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<PlanStatus> {
        self.status.subscribe()
    }

    /// Wait until the plan reaches a terminal status.
    pub async fn wait_terminal(&self) -> PlanStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            // The sender lives as long as `self`, so this is unreachable in practice.
            Err(_) => self.status(),
        };
        status
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::autopilot::plan::{Action, ActionKind, Deficit, PlanDraft};
    use crate::cache::segment::{MemoryTier, SegmentRef};
    use crate::config::RiskBudget;
    use crate::metrics::snapshot::{CacheCounters, MetricsSnapshot};

    fn handle() -> PlanHandle {
        let snapshot = MetricsSnapshot {
            namespace: "ns".into(),
            captured_at_ms: 0,
            hbm_used_bytes: 10,
            hbm_capacity_bytes: 100,
            ddr_used_bytes: 0,
            ddr_capacity_bytes: 100,
            p95_latency_ms: 1.0,
            ttft_ms: 1.0,
            accuracy_delta_pct: 0.0,
            counters: CacheCounters::default(),
            segments: Arc::from(Vec::new()),
        };
        let draft = PlanDraft {
            actions: vec![Action {
                kind: ActionKind::Evict,
                segment: SegmentRef::new("s"),
                tier: MemoryTier::Hbm,
                expected_delta_bytes: 5,
                projected_miss_increase: 0.0,
                projected_accuracy_delta_pct: 0.0,
            }],
            deficit: Deficit::default(),
            risk_budget: RiskBudget::default(),
            best_effort: false,
        };
        PlanHandle::new(Plan::from_draft(draft, Arc::new(snapshot)))
    }

    #[tokio::test]
    async fn test_advance_yields_to_pending_cancel() {
        let h = handle();
        h.transition(PlanStatus::ShadowChecking).await.unwrap();
        assert_eq!(h.try_cancel().await, Ok(true));

        assert_eq!(h.advance(PlanStatus::ShadowPass).await.unwrap(), Advance::Cancelled);
        assert_eq!(h.status(), PlanStatus::ShadowChecking);
    }

    #[tokio::test]
    async fn test_cancel_refused_once_advanced() {
        let h = handle();
        h.transition(PlanStatus::ShadowChecking).await.unwrap();
        assert_eq!(
            h.advance(PlanStatus::ShadowFail).await.unwrap(),
            Advance::Moved(PlanStatus::ShadowChecking)
        );
        assert_eq!(h.try_cancel().await, Err(PlanStatus::ShadowFail));
        assert!(!h.cancel_requested());
    }

    #[tokio::test]
    async fn test_abort_forces_terminal_and_wakes_waiters() {
        let h = Arc::new(handle());
        h.transition(PlanStatus::ShadowChecking).await.unwrap();

        let waiter = {
            let h = h.clone();
            tokio::spawn(async move { h.wait_terminal().await })
        };
        assert!(h.abort(PlanStatus::RolledBackPartial, "boom".into(), |_| {}).await);
        assert_eq!(waiter.await.unwrap(), PlanStatus::RolledBackPartial);

        // Already terminal.
        assert!(!h.abort(PlanStatus::RolledBack, "again".into(), |_| {}).await);
        assert_eq!(h.read().await.view().failure.as_deref(), Some("boom"));
    }
}
