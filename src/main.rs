//! kvopt-autopilot: guarded KV-cache tier rebalancing.
//!
//! Runs the autopilot against the in-memory simulated cache for a number of
//! cycles. Each cycle snapshots the namespace, submits a plan if the policy
//! finds a deficit, waits for it to finish and admits new segments so the
//! next cycle has work to do. Every finished plan is printed to stdout as
//! JSON, followed by the final counters.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use kvopt_autopilot::autopilot::controller::{AutopilotController, ControllerError};
use kvopt_autopilot::cache::simulated::{SimulatedCache, SimulatedEvictor, SimulatedQuantizer};
use kvopt_autopilot::config::{Cli, Config};
use kvopt_autopilot::metrics::snapshot::to_gib;
use kvopt_autopilot::providers::registry::{ProviderRegistry, Registration};
use kvopt_autopilot::providers::CapabilityProvider;

fn registration(config: &Config, name: &str) -> Registration {
    config
        .provider(name)
        .map(|p| Registration {
            enabled: p.enabled,
            priority: p.priority,
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kvopt_autopilot=debug"
    } else {
        "kvopt_autopilot=info"
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("kvopt-autopilot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if cli.dry_run {
        config.autopilot.dry_run = true;
    }
    let namespace = cli
        .namespace
        .clone()
        .unwrap_or_else(|| config.autopilot.default_namespace.clone());

    info!(
        namespace = %namespace,
        hbm_target_gib = to_gib(config.policy.hbm_target_bytes),
        sla_p95_ms = config.policy.sla_p95_ms,
        guard_mode = ?config.guard.mode,
        dry_run = config.autopilot.dry_run,
        "Configuration loaded"
    );

    // Simulated backend and its providers.
    let cache = SimulatedCache::from_config(namespace.clone(), &config.simulation);
    let providers: Vec<Arc<dyn CapabilityProvider>> = vec![
        Arc::new(SimulatedEvictor::new(cache.clone())),
        Arc::new(SimulatedQuantizer::new(cache.clone())),
    ];
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        let reg = registration(&config, provider.name());
        registry.register(provider, reg)?;
    }
    let registry = Arc::new(registry);
    registry.startup_all().await?;

    let controller = Arc::new(AutopilotController::new(
        config.clone(),
        Arc::new(cache.clone()),
        registry.clone(),
    )?);

    let admit_per_cycle = (config.simulation.segment_count / 5).max(1);
    for cycle in 1..=cli.cycles {
        let snapshot = cache.snapshot().await;
        info!(
            cycle,
            hbm_gib = to_gib(snapshot.hbm_used_bytes),
            p95_ms = snapshot.p95_latency_ms,
            segments = snapshot.segments.len(),
            "Cycle snapshot"
        );

        match controller.submit(snapshot) {
            Ok(id) => {
                let view = controller.wait(id).await?;
                info!(
                    cycle,
                    plan_id = %id,
                    status = %view.status,
                    actions = view.actions.len(),
                    best_effort = view.best_effort,
                    freed_gib = to_gib(view.freed_bytes),
                    "Plan finished"
                );
                if let Some(failure) = &view.failure {
                    warn!(cycle, plan_id = %id, failure = %failure, "Plan did not apply cleanly");
                }
                println!("{}", serde_json::to_string_pretty(&view)?);
            }
            Err(ControllerError::NoActionNeeded { .. }) => {
                info!(cycle, "Nothing to do this cycle");
            }
            Err(e) => return Err(e.into()),
        }

        let admitted = cache.admit(admit_per_cycle).await;
        info!(cycle, admitted, "Simulated new traffic");
    }

    let report = controller.metrics_with_snapshot(&namespace).await?;
    println!("{}", serde_json::to_string_pretty(&report.counters)?);
    info!(
        hbm_gib = to_gib(report.snapshot.hbm_used_bytes),
        p95_ms = report.snapshot.p95_latency_ms,
        "Final state"
    );

    for (name, health) in registry.health() {
        info!(provider = %name, ?health, "Provider health");
    }

    registry.shutdown_all().await;
    Ok(())
}
