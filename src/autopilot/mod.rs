//! The autopilot control loop.
//!
//! - [`policy`]: turns a metrics snapshot into a ranked plan draft
//! - [`plan`]: Plan, Action and the status state machine
//! - [`guard`]: shadow and post-apply safety checks
//! - [`executor`]: applies and reverts actions through capability providers
//! - [`handle`]: shared, lockable plan handle with status watch
//! - [`controller`]: per-namespace lifecycle orchestration

pub mod controller;
pub mod executor;
pub mod guard;
pub mod handle;
pub mod plan;
pub mod policy;
