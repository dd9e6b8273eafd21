//! Runtime configuration for kvopt-autopilot.
//!
//! Configuration is loaded once from a JSON file (or constructed
//! programmatically) and validated before any plan can be submitted. All
//! policy thresholds, guard limits, timeouts and ranking weights live here.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::segment::CacheFormat;
use crate::metrics::snapshot::{gib, to_gib};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kvopt-autopilot", about = "Guarded KV-cache tier rebalancing autopilot")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Cache namespace to operate on (defaults to `autopilot.default_namespace`).
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Number of autopilot cycles to run against the simulated cache.
    #[arg(long, default_value_t = 3)]
    pub cycles: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    /// Plan and shadow-check only; never apply (overrides `autopilot.dry_run`).
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Controller settings.
    pub autopilot: AutopilotConfig,

    /// Plan generation.
    pub policy: PolicyConfig,

    /// Safety thresholds.
    pub guard: GuardConfig,

    /// Action execution.
    pub executor: ExecutorConfig,

    /// Shared latency projection model used by policy and guard.
    pub latency_model: LatencyModel,

    /// Accuracy cost of quantization steps, used by the policy.
    pub accuracy_model: AccuracyModel,

    /// Priority/enablement of registered capability providers.
    pub providers: Vec<ProviderConfig>,

    /// In-memory backend used by the CLI.
    pub simulation: SimulationConfig,
}

/// Controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Namespace used when none is given on the command line.
    pub default_namespace: String,

    /// Terminal plans kept queryable before the oldest are dropped.
    pub max_retained_plans: usize,

    /// Stop every plan after a passing shadow check.
    pub dry_run: bool,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            max_retained_plans: 256,
            dry_run: false,
        }
    }
}

/// Maximum regression a plan is allowed to cause.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskBudget {
    /// Projected P95 increase allowed, in ms.
    pub max_latency_regression_ms: f64,

    /// Projected reuse misses per window allowed.
    pub max_reuse_miss_increase: f64,

    /// Projected accuracy loss allowed, in percentage points.
    pub max_accuracy_delta_pct: f64,
}

impl Default for RiskBudget {
    fn default() -> Self {
        Self {
            max_latency_regression_ms: 100.0,
            max_reuse_miss_increase: 50.0,
            max_accuracy_delta_pct: 0.5,
        }
    }
}

/// Policy engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Target HBM occupancy in bytes.
    pub hbm_target_bytes: u64,

    /// Optional target DDR occupancy in bytes.
    pub ddr_target_bytes: Option<u64>,

    /// P95 latency SLA in ms.
    pub sla_p95_ms: f64,

    /// Segments reused within this window are never selected.
    pub protect_recent_ms: u64,

    /// Cost weight applied to the projected misses of an eviction.
    pub evict_weight: f64,

    /// Cost weight applied to the projected misses of a quantization.
    pub quantize_weight: f64,

    /// Fraction of a segment's reuse hits a quantization turns into misses.
    pub quantize_miss_factor: f64,

    /// Upper bound on plan length.
    pub max_actions: usize,

    /// Risk budget attached to every plan.
    pub risk_budget: RiskBudget,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            hbm_target_bytes: gib(11.0),
            ddr_target_bytes: None,
            sla_p95_ms: 2000.0,
            protect_recent_ms: 5_000,
            evict_weight: 1.0,
            quantize_weight: 1.0,
            quantize_miss_factor: 0.1,
            max_actions: 64,
            risk_budget: RiskBudget::default(),
        }
    }
}

/// Whether the shadow check runs against the submitted snapshot or a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    Shadow,
    Live,
}

/// Guard thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub mode: GuardMode,

    /// Maximum P95 increase (ms) between before and after.
    pub max_latency_regression_ms: f64,

    /// Maximum increase of the reuse-miss counter between before and after.
    pub max_reuse_miss_increase: f64,

    /// Maximum accuracy drift (percentage points) between before and after.
    pub max_accuracy_delta_pct: f64,

    /// Fail the post check, and so roll back, on observed accuracy drift.
    /// The shadow check always enforces the projected drift.
    pub rollback_on_accuracy_delta: bool,

    /// Fraction of the targeted deficit a completed plan may fall short by.
    pub deficit_tolerance: f64,

    /// Bound on snapshot fetches performed for a check.
    pub check_timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            mode: GuardMode::Shadow,
            max_latency_regression_ms: 100.0,
            max_reuse_miss_increase: 50.0,
            max_accuracy_delta_pct: 0.5,
            rollback_on_accuracy_delta: true,
            deficit_tolerance: 0.1,
            check_timeout_ms: 5_000,
        }
    }
}

/// Action executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Bound on every provider call (apply and revert).
    pub provider_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 2_000,
        }
    }
}

/// Linear latency projection.
///
/// ```text
/// projected_p95 = p95 - gain_ms_per_gib × freed_hbm_gib + miss_penalty_ms × added_misses
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyModel {
    /// P95 improvement per GiB of HBM freed.
    pub gain_ms_per_gib: f64,

    /// P95 cost of one additional reuse miss per window.
    pub miss_penalty_ms: f64,
}

impl Default for LatencyModel {
    fn default() -> Self {
        Self {
            gain_ms_per_gib: 200.0,
            miss_penalty_ms: 2.0,
        }
    }
}

impl LatencyModel {
    /// Projected P95 after freeing `freed_hbm_bytes` and adding `added_misses`.
    pub fn project_p95(&self, p95_ms: f64, freed_hbm_bytes: u64, added_misses: f64) -> f64 {
        p95_ms - self.gain_ms_per_gib * to_gib(freed_hbm_bytes) + self.miss_penalty_ms * added_misses
    }

    /// HBM bytes that must be freed to shave `latency_ms` off P95.
    pub fn bytes_for_latency(&self, latency_ms: f64) -> u64 {
        if latency_ms <= 0.0 || self.gain_ms_per_gib <= 0.0 {
            return 0;
        }
        gib(latency_ms / self.gain_ms_per_gib)
    }
}

/// Accuracy lost by quantizing one step into a format, in percentage points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AccuracyModel {
    /// FP16 -> Q8.
    pub q8_cost_pct: f64,

    /// Q8 -> Q4.
    pub q4_cost_pct: f64,
}

impl Default for AccuracyModel {
    fn default() -> Self {
        Self {
            q8_cost_pct: 0.02,
            q4_cost_pct: 0.1,
        }
    }
}

impl AccuracyModel {
    /// Cost of a quantization step that lands in `to`.
    pub fn step_cost_pct(&self, to: CacheFormat) -> f64 {
        match to {
            CacheFormat::Fp16 => 0.0,
            CacheFormat::Q8 => self.q8_cost_pct,
            CacheFormat::Q4 => self.q4_cost_pct,
        }
    }
}

/// Per-provider registration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

/// Simulated backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub hbm_capacity_bytes: u64,
    pub ddr_capacity_bytes: u64,

    /// Number of FP16 segments seeded in HBM.
    pub segment_count: usize,

    /// Size of each seeded segment.
    pub segment_bytes: u64,

    /// P95 with an empty HBM.
    pub base_p95_ms: f64,

    /// P95 added per GiB of HBM in use.
    pub p95_ms_per_gib: f64,

    pub ttft_ms: f64,

    /// Keep evicted segments so evictions can be restored.
    pub retain_evicted: bool,

    /// Keep pre-quantization data so quantizations can be reverted.
    pub retain_quantized: bool,

    /// Accuracy drift the backend reports per quantization step.
    pub accuracy: AccuracyModel,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            hbm_capacity_bytes: gib(16.0),
            ddr_capacity_bytes: gib(64.0),
            segment_count: 50,
            segment_bytes: gib(0.25),
            base_p95_ms: 800.0,
            p95_ms_per_gib: 104.0,
            ttft_ms: 180.0,
            retain_evicted: false,
            retain_quantized: true,
            accuracy: AccuracyModel::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(field, format!("must be a finite, non-negative number (got {value})")));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults if the file is missing.
    ///
    /// The result is always validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no plan could safely run under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.autopilot.default_namespace.trim().is_empty() {
            return Err(invalid("autopilot.default_namespace", "must not be empty"));
        }
        if self.autopilot.max_retained_plans == 0 {
            return Err(invalid("autopilot.max_retained_plans", "must be at least 1"));
        }

        let p = &self.policy;
        check_non_negative("policy.sla_p95_ms", p.sla_p95_ms)?;
        check_non_negative("policy.evict_weight", p.evict_weight)?;
        check_non_negative("policy.quantize_weight", p.quantize_weight)?;
        check_non_negative(
            "policy.risk_budget.max_latency_regression_ms",
            p.risk_budget.max_latency_regression_ms,
        )?;
        check_non_negative(
            "policy.risk_budget.max_reuse_miss_increase",
            p.risk_budget.max_reuse_miss_increase,
        )?;
        check_non_negative(
            "policy.risk_budget.max_accuracy_delta_pct",
            p.risk_budget.max_accuracy_delta_pct,
        )?;
        if !(0.0..=1.0).contains(&p.quantize_miss_factor) {
            return Err(invalid("policy.quantize_miss_factor", "must be within [0, 1]"));
        }
        if p.max_actions == 0 {
            return Err(invalid("policy.max_actions", "must be at least 1"));
        }

        let g = &self.guard;
        check_non_negative("guard.max_latency_regression_ms", g.max_latency_regression_ms)?;
        check_non_negative("guard.max_reuse_miss_increase", g.max_reuse_miss_increase)?;
        check_non_negative("guard.max_accuracy_delta_pct", g.max_accuracy_delta_pct)?;
        if !(0.0..1.0).contains(&g.deficit_tolerance) {
            return Err(invalid("guard.deficit_tolerance", "must be within [0, 1)"));
        }
        if g.check_timeout_ms == 0 {
            return Err(invalid("guard.check_timeout_ms", "must be greater than zero"));
        }
        if self.executor.provider_timeout_ms == 0 {
            return Err(invalid("executor.provider_timeout_ms", "must be greater than zero"));
        }

        check_non_negative("latency_model.gain_ms_per_gib", self.latency_model.gain_ms_per_gib)?;
        check_non_negative("latency_model.miss_penalty_ms", self.latency_model.miss_penalty_ms)?;
        check_non_negative("accuracy_model.q8_cost_pct", self.accuracy_model.q8_cost_pct)?;
        check_non_negative("accuracy_model.q4_cost_pct", self.accuracy_model.q4_cost_pct)?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(invalid(
                    "providers",
                    format!("duplicate provider name {:?}", provider.name),
                ));
            }
        }

        let sim = &self.simulation;
        if p.hbm_target_bytes > sim.hbm_capacity_bytes {
            return Err(invalid(
                "policy.hbm_target_bytes",
                "exceeds simulation.hbm_capacity_bytes",
            ));
        }
        check_non_negative("simulation.base_p95_ms", sim.base_p95_ms)?;
        check_non_negative("simulation.p95_ms_per_gib", sim.p95_ms_per_gib)?;

        Ok(())
    }

    /// Registration settings for a provider, if configured.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.policy.hbm_target_bytes, gib(11.0));
        assert_eq!(cfg.guard.mode, GuardMode::Shadow);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.policy.max_actions, 64);
    }

    #[test]
    fn test_load_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "policy": { "sla_p95_ms": 1500.0 }, "guard": { "mode": "live" } }"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.policy.sla_p95_ms, 1500.0);
        assert_eq!(cfg.policy.quantize_miss_factor, 0.1);
        assert_eq!(cfg.guard.mode, GuardMode::Live);
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut cfg = Config::default();
        cfg.guard.max_latency_regression_ms = f64::NAN;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "guard.max_latency_regression_ms", .. })
        ));

        let mut cfg = Config::default();
        cfg.policy.quantize_miss_factor = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.executor.provider_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.guard.max_accuracy_delta_pct = -0.1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "guard.max_accuracy_delta_pct", .. })
        ));
    }

    #[test]
    fn test_dry_run_and_accuracy_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "autopilot": { "dry_run": true },
                "guard": { "max_accuracy_delta_pct": 0.25, "rollback_on_accuracy_delta": false },
                "accuracy_model": { "q4_cost_pct": 0.3 }
            }"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert!(cfg.autopilot.dry_run);
        assert_eq!(cfg.guard.max_accuracy_delta_pct, 0.25);
        assert!(!cfg.guard.rollback_on_accuracy_delta);
        assert_eq!(cfg.accuracy_model.step_cost_pct(CacheFormat::Q4), 0.3);
        assert_eq!(cfg.accuracy_model.step_cost_pct(CacheFormat::Q8), 0.02);
        assert_eq!(cfg.accuracy_model.step_cost_pct(CacheFormat::Fp16), 0.0);
    }

    #[test]
    fn test_validate_rejects_duplicate_providers() {
        let mut cfg = Config::default();
        let provider = ProviderConfig {
            name: "lmcache".into(),
            enabled: true,
            priority: 0,
        };
        cfg.providers = vec![provider.clone(), provider];
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "providers", .. })
        ));
    }
}
