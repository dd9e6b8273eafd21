//! Integration tests for the action executor.

mod common;

use std::sync::Arc;

use kvopt_autopilot::autopilot::executor::{ActionExecutor, ExecutionResult};
use kvopt_autopilot::autopilot::handle::PlanHandle;
use kvopt_autopilot::autopilot::plan::{
    Action, ActionKind, ActionOutcome, Deficit, Plan, PlanDraft, PlanStatus,
};
use kvopt_autopilot::cache::segment::{MemoryTier, SegmentRef};
use kvopt_autopilot::config::{ExecutorConfig, RiskBudget};
use kvopt_autopilot::metrics::counters::AutopilotCounters;
use kvopt_autopilot::metrics::snapshot::gib;
use kvopt_autopilot::providers::{CapabilityProvider, PluginType, ProviderError};

use common::*;

fn action(kind: ActionKind, segment: &str) -> Action {
    Action {
        kind,
        segment: SegmentRef::new(segment),
        tier: MemoryTier::Hbm,
        expected_delta_bytes: gib(1.0),
        projected_miss_increase: 1.0,
        projected_accuracy_delta_pct: 0.0,
    }
}

/// A handle already in APPLYING, as the controller would pass it.
async fn applying(actions: Vec<Action>) -> PlanHandle {
    let draft = PlanDraft {
        actions,
        deficit: Deficit {
            hbm_bytes: gib(2.0),
            ..Default::default()
        },
        risk_budget: RiskBudget::default(),
        best_effort: false,
    };
    let handle = PlanHandle::new(Plan::from_draft(draft, Arc::new(pressured_snapshot())));
    for next in [
        PlanStatus::ShadowChecking,
        PlanStatus::ShadowPass,
        PlanStatus::Applying,
    ] {
        handle.transition(next).await.unwrap();
    }
    handle
}

fn executor(
    providers: Vec<Arc<dyn CapabilityProvider>>,
    counters: Arc<AutopilotCounters>,
) -> ActionExecutor {
    ActionExecutor::new(registry(providers), ExecutorConfig::default(), counters)
}

#[tokio::test]
async fn test_apply_routes_by_kind_in_order() {
    let kv = Arc::new(ScriptedProvider::new("kv", PluginType::KvCache, gib(1.0)));
    let quant = Arc::new(ScriptedProvider::new("q", PluginType::Quantization, gib(0.5)));
    let counters = Arc::new(AutopilotCounters::new());
    let providers: Vec<Arc<dyn CapabilityProvider>> = vec![kv.clone(), quant.clone()];
    let exec = executor(providers, counters.clone());

    let handle = applying(vec![
        action(ActionKind::Quantize, "s0"),
        action(ActionKind::Evict, "s1"),
        action(ActionKind::Quantize, "s2"),
    ])
    .await;

    match exec.apply(&handle).await.unwrap() {
        ExecutionResult::Completed {
            applied,
            freed_bytes,
        } => {
            assert_eq!(applied, vec![0, 1, 2]);
            assert_eq!(freed_bytes, gib(2.0));
        }
        other => panic!("expected completion, got {other:?}"),
    }

    let quant_calls: Vec<_> = quant.calls().into_iter().map(|(_, s)| s.0).collect();
    assert_eq!(quant_calls, vec!["s0", "s2"]);
    assert_eq!(kv.count("evict"), 1);

    let snap = counters.snapshot();
    assert_eq!(snap.quantized, 2);
    assert_eq!(snap.evicted, 1);
    assert_eq!(handle.read().await.freed_bytes(), gib(2.0));
}

#[tokio::test]
async fn test_missing_provider_fails_first_action() {
    let kv = Arc::new(ScriptedProvider::new("kv", PluginType::KvCache, gib(1.0)));
    let exec = executor(only(&kv), Arc::new(AutopilotCounters::new()));

    let handle = applying(vec![
        action(ActionKind::Evict, "s0"),
        action(ActionKind::Quantize, "s1"),
    ])
    .await;

    match exec.apply(&handle).await.unwrap() {
        ExecutionResult::Failed {
            index,
            error,
            revert,
        } => {
            assert_eq!(index, 1);
            assert_eq!(error, ProviderError::NoProvider(ActionKind::Quantize));
            assert_eq!(revert.reverted, vec![0]);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(handle.status(), PlanStatus::RollingBack);
    assert_eq!(
        handle.read().await.view().outcomes(),
        vec![ActionOutcome::Reverted, ActionOutcome::Failed]
    );
}

#[tokio::test]
async fn test_irreversible_revert_is_reported() {
    let kv = Arc::new(ScriptedProvider::new("kv", PluginType::KvCache, gib(1.0)).irreversible());
    let counters = Arc::new(AutopilotCounters::new());
    let exec = executor(only(&kv), counters.clone());

    let handle = applying(vec![
        action(ActionKind::Evict, "s0"),
        action(ActionKind::Evict, "s1"),
    ])
    .await;
    exec.apply(&handle).await.unwrap();

    let result = exec.revert(&handle, &[0, 1]).await.unwrap();
    assert!(!result.is_complete());
    assert!(result.reverted.is_empty());
    // Newest first.
    assert_eq!(result.failures[0].index, 1);
    assert_eq!(result.failures[1].index, 0);

    // The provider was never asked to restore.
    assert_eq!(kv.count("restore"), 0);
    let plan = handle.read().await;
    assert!(plan
        .records()
        .iter()
        .all(|r| r.outcome == ActionOutcome::Applied && r.revert_error.is_some()));
    assert_eq!(counters.snapshot().revert_failures, 2);
}

#[tokio::test]
async fn test_cancel_before_first_action() {
    let kv = Arc::new(ScriptedProvider::new("kv", PluginType::KvCache, gib(1.0)));
    let exec = executor(only(&kv), Arc::new(AutopilotCounters::new()));

    let handle = applying(vec![action(ActionKind::Evict, "s0")]).await;
    assert!(handle.request_cancel());
    assert!(!handle.request_cancel());

    match exec.apply(&handle).await.unwrap() {
        ExecutionResult::Cancelled { applied } => assert!(applied.is_empty()),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(kv.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_during_failing_action_wins() {
    let kv = Arc::new(
        ScriptedProvider::new("kv", PluginType::KvCache, gib(1.0))
            .gated_at(2)
            .fail_at_gate(),
    );
    let exec = Arc::new(executor(only(&kv), Arc::new(AutopilotCounters::new())));
    let handle = Arc::new(
        applying(vec![
            action(ActionKind::Evict, "s0"),
            action(ActionKind::Evict, "s1"),
        ])
        .await,
    );

    let run = {
        let (exec, handle) = (exec.clone(), handle.clone());
        tokio::spawn(async move { exec.apply(&handle).await })
    };
    kv.reached.notified().await;
    assert_eq!(handle.try_cancel().await, Ok(true));
    kv.release.notify_one();

    match run.await.unwrap().unwrap() {
        ExecutionResult::Cancelled { applied } => assert_eq!(applied, vec![0]),
        other => panic!("expected cancellation, got {other:?}"),
    }
    // Reverting is left to the caller; the plan has not started rolling back.
    assert_eq!(handle.status(), PlanStatus::Applying);
    assert_eq!(kv.count("restore"), 0);
    assert_eq!(
        handle.read().await.view().outcomes(),
        vec![ActionOutcome::Applied, ActionOutcome::Failed]
    );
}
