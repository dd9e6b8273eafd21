//! kvopt-autopilot: guarded KV-cache tier rebalancing for LLM serving.
//!
//! Watches HBM/DDR usage and P95 latency per cache namespace, plans
//! evictions and quantizations that bring memory back under target, checks
//! the plan against a projected snapshot before touching anything, applies
//! it through pluggable capability providers, and rolls it back if the
//! observed result regresses.

pub mod autopilot;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod providers;
