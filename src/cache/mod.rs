//! KV cache model and the in-memory simulated backend.
//!
//! - [`segment`]: SegmentRef, SegmentInfo, MemoryTier and CacheFormat
//! - [`simulated`]: in-memory cache implementing the snapshot and capability contracts

pub mod segment;
pub mod simulated;
