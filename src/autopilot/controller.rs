//! Autopilot controller: owns plans and drives each one through its lifecycle.
//!
//! `submit` builds a plan from a snapshot and spawns a task that runs it:
//! shadow check, apply, post check, and rollback when needed. At most one
//! plan is active per namespace; a second submit is rejected, never queued.
//!
//! Every exit from a cancellable status goes through [`PlanHandle::advance`],
//! so an accepted cancellation always ends the plan CANCELLED. A dry-run plan
//! stops at DRY_RUN once its shadow check passes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};

use crate::autopilot::executor::{ActionExecutor, ExecutionResult, RevertResult};
use crate::autopilot::guard::{metric, Checkpoint, Guard, GuardVerdict};
use crate::autopilot::handle::{Advance, PlanHandle};
use crate::autopilot::plan::{Plan, PlanError, PlanId, PlanStatus, PlanView};
use crate::autopilot::policy::{PolicyEngine, Proposal};
use crate::config::{Config, ConfigError, GuardMode};
use crate::metrics::counters::{AutopilotCounters, CounterSnapshot};
use crate::metrics::snapshot::{MetricsSnapshot, SnapshotProvider};
use crate::providers::registry::ProviderRegistry;
use crate::providers::ProviderError;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Namespace {namespace} already has active plan {active}")]
    ConcurrencyConflict { namespace: String, active: PlanId },

    #[error("No action needed for namespace {namespace}")]
    NoActionNeeded { namespace: String },

    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Plan {id} is already terminal ({status})")]
    AlreadyTerminal { id: PlanId, status: PlanStatus },

    #[error("Plan {id} cannot be cancelled in {status}")]
    NotCancellable { id: PlanId, status: PlanStatus },

    #[error("Cannot reload config while {active} plan(s) are active")]
    ConfigReloadWhilePlanActive { active: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Snapshot unavailable: {0}")]
    Snapshot(#[source] ProviderError),
}

/// Counters plus the namespace's current snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub counters: CounterSnapshot,
    pub snapshot: MetricsSnapshot,
}

/// Everything derived from one configuration. Swapped whole on reload.
struct Engines {
    config: Config,
    policy: PolicyEngine,
    guard: Guard,
    executor: ActionExecutor,
}

impl Engines {
    fn build(
        config: Config,
        registry: Arc<ProviderRegistry>,
        counters: Arc<AutopilotCounters>,
    ) -> Self {
        Self {
            policy: PolicyEngine::from_config(&config),
            guard: Guard::from_config(&config),
            executor: ActionExecutor::new(registry, config.executor.clone(), counters),
            config,
        }
    }
}

type ActiveMap = HashMap<String, PlanId>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases a namespace slot when the lifecycle task ends, however it ends.
struct ActiveSlot {
    active: Arc<Mutex<ActiveMap>>,
    namespace: String,
    id: PlanId,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut active = lock(&self.active);
        if active.get(&self.namespace) == Some(&self.id) {
            active.remove(&self.namespace);
        }
    }
}

/// Plans by id, oldest first.
#[derive(Default)]
struct PlanStore {
    plans: HashMap<PlanId, Arc<PlanHandle>>,
    order: VecDeque<PlanId>,
}

impl PlanStore {
    fn insert(&mut self, handle: Arc<PlanHandle>, limit: usize) {
        self.order.push_back(handle.id());
        self.plans.insert(handle.id(), handle);

        // Only terminal plans are dropped; active ones may exceed the limit.
        while self.plans.len() > limit {
            let oldest = self.order.iter().position(|id| {
                self.plans
                    .get(id)
                    .map_or(true, |h| h.status().is_terminal())
            });
            match oldest.and_then(|pos| self.order.remove(pos)) {
                Some(id) => {
                    self.plans.remove(&id);
                }
                None => break,
            }
        }
    }

    fn get(&self, id: PlanId) -> Option<Arc<PlanHandle>> {
        self.plans.get(&id).cloned()
    }
}

pub struct AutopilotController {
    engines: RwLock<Arc<Engines>>,
    snapshots: Arc<dyn SnapshotProvider>,
    registry: Arc<ProviderRegistry>,
    plans: Mutex<PlanStore>,
    active: Arc<Mutex<ActiveMap>>,
    counters: Arc<AutopilotCounters>,
}

impl AutopilotController {
    pub fn new(
        config: Config,
        snapshots: Arc<dyn SnapshotProvider>,
        registry: Arc<ProviderRegistry>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        let counters = Arc::new(AutopilotCounters::new());
        let engines = Engines::build(config, registry.clone(), counters.clone());
        Ok(Self {
            engines: RwLock::new(Arc::new(engines)),
            snapshots,
            registry,
            plans: Mutex::new(PlanStore::default()),
            active: Arc::new(Mutex::new(HashMap::new())),
            counters,
        })
    }

    fn engines(&self) -> Arc<Engines> {
        self.engines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> Config {
        self.engines().config.clone()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Build a plan from `snapshot` and start running it.
    ///
    /// Returns as soon as the plan exists; poll [`status`](Self::status) or
    /// [`wait`](Self::wait) for the outcome.
    pub fn submit(self: &Arc<Self>, snapshot: MetricsSnapshot) -> Result<PlanId, ControllerError> {
        let namespace = snapshot.namespace.clone();

        // Hold the active map across proposal so a conflicting submit or a
        // reload cannot interleave.
        let mut active = lock(&self.active);
        if let Some(&existing) = active.get(&namespace) {
            self.counters.record_conflict();
            warn!(
                namespace = %namespace,
                active = %existing,
                "Rejected submit: namespace has an active plan"
            );
            return Err(ControllerError::ConcurrencyConflict {
                namespace,
                active: existing,
            });
        }

        let engines = self.engines();
        let draft = match engines.policy.propose(&snapshot) {
            Proposal::NoActionNeeded => {
                info!(namespace = %namespace, "No action needed");
                return Err(ControllerError::NoActionNeeded { namespace });
            }
            Proposal::Plan(draft) => draft,
        };

        let plan = Plan::from_draft(draft, Arc::new(snapshot))
            .with_dry_run(engines.config.autopilot.dry_run);
        let id = plan.id();
        let handle = Arc::new(PlanHandle::new(plan));
        active.insert(namespace.clone(), id);
        drop(active);

        let slot = ActiveSlot {
            active: self.active.clone(),
            namespace: namespace.clone(),
            id,
        };
        lock(&self.plans).insert(handle.clone(), engines.config.autopilot.max_retained_plans);
        self.counters.record_submitted();

        info!(plan_id = %id, namespace = %namespace, "Plan submitted");

        let span = info_span!("plan", plan_id = %id, namespace = %namespace);
        let controller = self.clone();
        tokio::spawn(
            async move {
                controller.run_lifecycle(engines, handle).await;
                drop(slot);
            }
            .instrument(span),
        );

        Ok(id)
    }

    fn handle(&self, id: PlanId) -> Result<Arc<PlanHandle>, ControllerError> {
        lock(&self.plans)
            .get(id)
            .ok_or(ControllerError::PlanNotFound(id))
    }

    /// Current view of a plan.
    pub async fn status(&self, id: PlanId) -> Result<PlanView, ControllerError> {
        let handle = self.handle(id)?;
        let view = handle.read().await.view();
        Ok(view)
    }

    /// Wait for a plan to reach a terminal status and return its final view.
    pub async fn wait(&self, id: PlanId) -> Result<PlanView, ControllerError> {
        let handle = self.handle(id)?;
        handle.wait_terminal().await;
        let view = handle.read().await.view();
        Ok(view)
    }

    /// Request cancellation. Honored at the next lifecycle boundary.
    ///
    /// Once this returns `Ok` the plan is guaranteed to end CANCELLED.
    pub async fn cancel(&self, id: PlanId) -> Result<(), ControllerError> {
        let handle = self.handle(id)?;
        match handle.try_cancel().await {
            Ok(first) => {
                if first {
                    info!(plan_id = %id, status = %handle.status(), "Cancellation requested");
                }
                Ok(())
            }
            Err(status) if status.is_terminal() => {
                Err(ControllerError::AlreadyTerminal { id, status })
            }
            Err(status) => Err(ControllerError::NotCancellable { id, status }),
        }
    }

    pub fn metrics(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Counters together with a fresh snapshot of `namespace`.
    pub async fn metrics_with_snapshot(
        &self,
        namespace: &str,
    ) -> Result<MetricsReport, ControllerError> {
        let timeout_ms = self.engines().config.guard.check_timeout_ms;
        let snapshot = self
            .fetch_snapshot(namespace, timeout_ms)
            .await
            .map_err(ControllerError::Snapshot)?;
        Ok(MetricsReport {
            counters: self.counters.snapshot(),
            snapshot,
        })
    }

    /// The plan currently holding `namespace`, if any.
    pub fn active_plan(&self, namespace: &str) -> Option<PlanId> {
        lock(&self.active).get(namespace).copied()
    }

    /// Replace the configuration. Only allowed while no plan is active.
    pub fn reload_config(&self, config: Config) -> Result<(), ControllerError> {
        config.validate()?;

        let active = lock(&self.active);
        if !active.is_empty() {
            return Err(ControllerError::ConfigReloadWhilePlanActive {
                active: active.len(),
            });
        }

        let engines = Engines::build(config, self.registry.clone(), self.counters.clone());
        *self
            .engines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(engines);
        drop(active);

        info!("Configuration reloaded");
        Ok(())
    }

    async fn fetch_snapshot(
        &self,
        namespace: &str,
        timeout_ms: u64,
    ) -> Result<MetricsSnapshot, ProviderError> {
        match timeout(
            Duration::from_millis(timeout_ms),
            self.snapshots.current_snapshot(namespace),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                operation: "snapshot",
                timeout_ms,
            }),
        }
    }

    async fn run_lifecycle(&self, engines: Arc<Engines>, handle: Arc<PlanHandle>) {
        if let Err(e) = self.drive(&engines, &handle).await {
            error!(plan_id = %handle.id(), error = %e, "Plan lifecycle aborted");

            // Leave nothing applied behind a plan nobody is driving.
            let applied = handle.read().await.applied_indices();
            if !applied.is_empty() {
                match engines.executor.revert(&handle, &applied).await {
                    Ok(revert) => handle.write().await.set_rollback(revert),
                    Err(revert_error) => warn!(
                        plan_id = %handle.id(),
                        error = %revert_error,
                        "Revert after aborted lifecycle failed"
                    ),
                }
            }

            handle
                .abort(
                    PlanStatus::RolledBackPartial,
                    format!("lifecycle aborted: {e}"),
                    |_| self.counters.record_aborted(),
                )
                .await;
        }
    }

    async fn drive(&self, engines: &Engines, handle: &PlanHandle) -> Result<(), PlanError> {
        if handle.advance(PlanStatus::ShadowChecking).await? == Advance::Cancelled {
            return self.finish_cancelled(engines, handle, &[]).await;
        }

        let verdict = self.shadow_verdict(engines, handle).await;
        let passed = verdict.is_pass();
        let breach = verdict.breaching_metric().map(str::to_string);
        handle.write().await.record_verdict(verdict);

        let next = if passed {
            PlanStatus::ShadowPass
        } else {
            PlanStatus::ShadowFail
        };
        if handle.advance(next).await? == Advance::Cancelled {
            return self.finish_cancelled(engines, handle, &[]).await;
        }

        if !passed {
            handle.write().await.set_failure(format!(
                "shadow check failed on {}",
                breach.as_deref().unwrap_or("unknown")
            ));
            handle
                .transition_with(PlanStatus::Rejected, |_| self.counters.record_rejected())
                .await?;
            return Ok(());
        }

        if handle.read().await.is_dry_run() {
            let advanced = handle
                .advance_with(PlanStatus::DryRun, |_| self.counters.record_dry_run())
                .await?;
            if advanced == Advance::Cancelled {
                return self.finish_cancelled(engines, handle, &[]).await;
            }
            info!(plan_id = %handle.id(), "Dry run stopped after shadow check");
            return Ok(());
        }

        if handle.advance(PlanStatus::Applying).await? == Advance::Cancelled {
            return self.finish_cancelled(engines, handle, &[]).await;
        }

        match engines.executor.apply(handle).await? {
            ExecutionResult::Cancelled { applied } => {
                self.finish_cancelled(engines, handle, &applied).await
            }
            ExecutionResult::Failed {
                index,
                error,
                revert,
            } => {
                handle
                    .write()
                    .await
                    .set_failure(format!("action {index} failed: {error}"));
                self.finish_rollback(handle, revert).await
            }
            ExecutionResult::Completed {
                applied,
                freed_bytes,
            } => {
                info!(plan_id = %handle.id(), freed_bytes, "All actions applied");
                if handle.advance(PlanStatus::PostChecking).await? == Advance::Cancelled {
                    return self.finish_cancelled(engines, handle, &applied).await;
                }
                self.post_check(engines, handle).await
            }
        }
    }

    async fn shadow_verdict(&self, engines: &Engines, handle: &PlanHandle) -> GuardVerdict {
        let submitted = handle.read().await.snapshot().clone();
        let current = match engines.guard.config().mode {
            GuardMode::Shadow => Ok((*submitted).clone()),
            GuardMode::Live => {
                self.fetch_snapshot(handle.namespace(), engines.guard.config().check_timeout_ms)
                    .await
            }
        };

        let plan = handle.read().await;
        match current {
            Ok(snapshot) => engines.guard.shadow_check(&plan, &snapshot),
            Err(e) => unavailable(Checkpoint::Shadow, &submitted, &e),
        }
    }

    async fn post_check(&self, engines: &Engines, handle: &PlanHandle) -> Result<(), PlanError> {
        let after = self
            .fetch_snapshot(handle.namespace(), engines.guard.config().check_timeout_ms)
            .await;
        let verdict = {
            let plan = handle.read().await;
            let before = plan.snapshot();
            match after {
                Ok(after) => engines.guard.post_check(&plan, before, &after),
                Err(e) => unavailable(Checkpoint::Post, before, &e),
            }
        };

        let passed = verdict.is_pass();
        let breach = verdict.breaching_metric().map(str::to_string);
        handle.write().await.record_verdict(verdict);

        if passed {
            handle.transition(PlanStatus::PostPass).await?;
            handle
                .transition_with(PlanStatus::Applied, |_| self.counters.record_apply())
                .await?;
            return Ok(());
        }

        handle.transition(PlanStatus::PostFail).await?;
        handle.write().await.set_failure(format!(
            "post check failed on {}",
            breach.as_deref().unwrap_or("unknown")
        ));
        handle.transition(PlanStatus::RollingBack).await?;
        let applied = handle.read().await.applied_indices();
        let revert = engines.executor.revert(handle, &applied).await?;
        self.finish_rollback(handle, revert).await
    }

    async fn finish_rollback(
        &self,
        handle: &PlanHandle,
        revert: RevertResult,
    ) -> Result<(), PlanError> {
        let next = if revert.is_complete() {
            PlanStatus::RolledBack
        } else {
            PlanStatus::RolledBackPartial
        };
        if !revert.is_complete() {
            warn!(
                plan_id = %handle.id(),
                failures = revert.failures.len(),
                "Rollback left actions applied"
            );
        }
        handle.write().await.set_rollback(revert);
        handle
            .transition_with(next, |_| self.counters.record_rollback())
            .await?;
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        engines: &Engines,
        handle: &PlanHandle,
        applied: &[usize],
    ) -> Result<(), PlanError> {
        let reverted = !applied.is_empty();
        if reverted {
            let revert = engines.executor.revert(handle, applied).await?;
            if !revert.is_complete() {
                handle
                    .write()
                    .await
                    .set_failure("cancelled with a partial rollback");
            }
            handle.write().await.set_rollback(revert);
        }
        handle
            .transition_with(PlanStatus::Cancelled, |_| {
                self.counters.record_cancelled();
                if reverted {
                    self.counters.record_rollback();
                }
            })
            .await?;
        Ok(())
    }
}

/// FAIL verdict for a checkpoint whose snapshot could not be fetched.
fn unavailable(checkpoint: Checkpoint, before: &MetricsSnapshot, e: &ProviderError) -> GuardVerdict {
    match e {
        ProviderError::Timeout { timeout_ms, .. } => GuardVerdict::unavailable(
            checkpoint,
            before,
            metric::TIMEOUT,
            *timeout_ms as f64,
            *timeout_ms as f64,
        ),
        _ => GuardVerdict::unavailable(checkpoint, before, metric::SNAPSHOT, 0.0, 1.0),
    }
}
