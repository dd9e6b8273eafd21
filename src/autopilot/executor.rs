//! Action executor: applies a plan's actions against capability providers.
//!
//! Actions run strictly in plan order, one at a time, each bounded by the
//! provider timeout. A failing action stops the run and every action applied
//! before it is reverted, newest first, before the failure is returned.
//! Cancellation is observed between actions, and a cancellation already
//! accepted when an action fails takes precedence over the failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::autopilot::handle::{Advance, PlanHandle};
use crate::autopilot::plan::{Action, ActionKind, PlanError, PlanStatus};
use crate::cache::segment::SegmentRef;
use crate::config::ExecutorConfig;
use crate::metrics::counters::AutopilotCounters;
use crate::providers::registry::ProviderRegistry;
use crate::providers::ProviderError;

/// An action whose revert did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertFailure {
    pub index: usize,
    pub kind: ActionKind,
    pub segment: SegmentRef,
    pub reason: String,
}

/// Outcome of reverting a set of applied actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevertResult {
    /// Indices reverted, in the order they were reverted.
    pub reverted: Vec<usize>,
    pub failures: Vec<RevertFailure>,
}

impl RevertResult {
    /// True when every applied action was undone.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of one apply run.
#[derive(Debug)]
pub enum ExecutionResult {
    /// Every action applied.
    Completed { applied: Vec<usize>, freed_bytes: u64 },

    /// Action `index` failed; earlier actions were reverted.
    Failed {
        index: usize,
        error: ProviderError,
        revert: RevertResult,
    },

    /// Cancellation observed after `applied` landed, either between actions
    /// or when an action failed. Nothing has been reverted.
    Cancelled { applied: Vec<usize> },
}

pub struct ActionExecutor {
    registry: Arc<ProviderRegistry>,
    config: ExecutorConfig,
    counters: Arc<AutopilotCounters>,
}

impl ActionExecutor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: ExecutorConfig,
        counters: Arc<AutopilotCounters>,
    ) -> Self {
        Self {
            registry,
            config,
            counters,
        }
    }

    /// Run a provider call under the configured timeout.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        let timeout_ms = self.config.provider_timeout_ms;
        match timeout(Duration::from_millis(timeout_ms), call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                operation,
                timeout_ms,
            }),
        }
    }

    /// Apply one action. Returns (freed bytes, reversible).
    async fn apply_action(&self, action: &Action) -> Result<(u64, bool), ProviderError> {
        let provider = self.registry.provider_for(action.kind)?;
        match action.kind {
            ActionKind::Evict => self
                .bounded("evict", provider.evict(&action.segment))
                .await
                .map(|o| (o.freed_bytes, o.restorable)),
            ActionKind::Quantize => self
                .bounded("quantize", provider.quantize(&action.segment))
                .await
                .map(|o| (o.freed_bytes, o.reversible)),
        }
    }

    async fn revert_action(&self, action: &Action, reversible: bool) -> Result<(), ProviderError> {
        if !reversible {
            return Err(ProviderError::NotReversible(action.segment.clone()));
        }
        let provider = self.registry.provider_for(action.kind)?;
        match action.kind {
            ActionKind::Evict => self.bounded("restore", provider.restore(&action.segment)).await,
            ActionKind::Quantize => {
                self.bounded("dequantize", provider.dequantize(&action.segment))
                    .await
            }
        }
    }

    /// Apply the plan's actions in order.
    ///
    /// On provider failure the plan moves to ROLLING_BACK and the actions
    /// applied so far are reverted before this returns, unless a
    /// cancellation was already accepted.
    pub async fn apply(&self, handle: &PlanHandle) -> Result<ExecutionResult, PlanError> {
        let actions = handle.read().await.actions();
        let mut applied = Vec::with_capacity(actions.len());
        let mut freed_bytes = 0u64;

        for (index, action) in actions.iter().enumerate() {
            if handle.cancel_requested() {
                info!(
                    plan_id = %handle.id(),
                    applied = applied.len(),
                    remaining = actions.len() - index,
                    "Cancellation observed between actions"
                );
                return Ok(ExecutionResult::Cancelled { applied });
            }

            match self.apply_action(action).await {
                Ok((bytes, reversible)) => {
                    handle.write().await.mark_applied(index, bytes, reversible)?;
                    self.counters.record_action(action.kind);
                    applied.push(index);
                    freed_bytes += bytes;
                    debug!(
                        plan_id = %handle.id(),
                        index,
                        kind = %action.kind,
                        segment = %action.segment,
                        freed_bytes = bytes,
                        reversible,
                        "Action applied"
                    );
                }
                Err(error) => {
                    warn!(
                        plan_id = %handle.id(),
                        index,
                        kind = %action.kind,
                        segment = %action.segment,
                        error = %error,
                        "Action failed"
                    );
                    handle.write().await.mark_failed(index, error.to_string())?;
                    if handle.advance(PlanStatus::RollingBack).await? == Advance::Cancelled {
                        info!(
                            plan_id = %handle.id(),
                            applied = applied.len(),
                            "Cancellation takes precedence over action failure"
                        );
                        return Ok(ExecutionResult::Cancelled { applied });
                    }
                    let revert = self.revert(handle, &applied).await?;
                    return Ok(ExecutionResult::Failed {
                        index,
                        error,
                        revert,
                    });
                }
            }
        }

        Ok(ExecutionResult::Completed {
            applied,
            freed_bytes,
        })
    }

    /// Revert the given applied actions, newest first.
    ///
    /// A failed revert leaves the action APPLIED with its revert error set.
    pub async fn revert(
        &self,
        handle: &PlanHandle,
        applied: &[usize],
    ) -> Result<RevertResult, PlanError> {
        let actions = handle.read().await.actions();
        let mut result = RevertResult::default();

        for &index in applied.iter().rev() {
            let action = actions.get(index).ok_or(PlanError::NoSuchAction(index))?;
            let reversible = handle
                .read()
                .await
                .records()
                .get(index)
                .and_then(|r| r.reversible)
                .unwrap_or(false);

            match self.revert_action(action, reversible).await {
                Ok(()) => {
                    handle.write().await.mark_reverted(index)?;
                    result.reverted.push(index);
                    debug!(
                        plan_id = %handle.id(),
                        index,
                        kind = %action.kind,
                        segment = %action.segment,
                        "Action reverted"
                    );
                }
                Err(error) => {
                    warn!(
                        plan_id = %handle.id(),
                        index,
                        kind = %action.kind,
                        segment = %action.segment,
                        error = %error,
                        "Revert failed"
                    );
                    handle
                        .write()
                        .await
                        .mark_revert_failed(index, error.to_string())?;
                    result.failures.push(RevertFailure {
                        index,
                        kind: action.kind,
                        segment: action.segment.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        self.counters.record_revert_failures(result.failures.len());
        Ok(result)
    }
}
