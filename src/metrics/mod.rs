//! Metrics consumed and produced by the autopilot.
//!
//! - [`snapshot`]: MetricsSnapshot and the SnapshotProvider contract
//! - [`counters`]: atomic aggregate counters owned by the controller

pub mod counters;
pub mod snapshot;
