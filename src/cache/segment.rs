//! KV cache segment descriptors.
//!
//! A segment is the unit the autopilot acts on: a contiguous range of KV
//! state owned by some backend. The autopilot never holds segment data, only
//! the inventory entry a snapshot provider reports for it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies which memory tier a segment currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryTier {
    /// Tier 0: GPU high-bandwidth memory (hot).
    Hbm,
    /// Tier 1: host DDR (warm).
    Ddr,
}

impl MemoryTier {
    /// Returns the numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            MemoryTier::Hbm => 0,
            MemoryTier::Ddr => 1,
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryTier::Hbm => write!(f, "HBM"),
            MemoryTier::Ddr => write!(f, "DDR"),
        }
    }
}

/// The quantization / storage format of a segment's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheFormat {
    /// Full precision FP16 (native GPU format).
    Fp16,
    /// 8-bit quantized.
    Q8,
    /// 4-bit quantized.
    Q4,
}

impl CacheFormat {
    /// Bytes per element for this format.
    pub fn bytes_per_element(&self) -> f64 {
        match self {
            CacheFormat::Fp16 => 2.0,
            CacheFormat::Q8 => 1.0,
            CacheFormat::Q4 => 0.5,
        }
    }

    /// The next smaller format, or None if already at the smallest.
    pub fn quantized(&self) -> Option<CacheFormat> {
        match self {
            CacheFormat::Fp16 => Some(CacheFormat::Q8),
            CacheFormat::Q8 => Some(CacheFormat::Q4),
            CacheFormat::Q4 => None,
        }
    }

    /// The previous, wider format, or None if already full precision.
    pub fn dequantized(&self) -> Option<CacheFormat> {
        match self {
            CacheFormat::Fp16 => None,
            CacheFormat::Q8 => Some(CacheFormat::Fp16),
            CacheFormat::Q4 => Some(CacheFormat::Q8),
        }
    }

    /// Size of `bytes` worth of data in this format once re-encoded as `to`.
    pub fn resize(&self, bytes: u64, to: CacheFormat) -> u64 {
        let ratio = to.bytes_per_element() / self.bytes_per_element();
        (bytes as f64 * ratio).round() as u64
    }
}

impl fmt::Display for CacheFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheFormat::Fp16 => write!(f, "FP16"),
            CacheFormat::Q8 => write!(f, "Q8"),
            CacheFormat::Q4 => write!(f, "Q4"),
        }
    }
}

/// Opaque reference to a cache segment (a key or key range in the backend).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentRef(pub String);

impl SegmentRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Inventory entry for a single segment, as reported in a metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Backend reference for this segment.
    pub segment: SegmentRef,

    /// Current memory tier.
    pub tier: MemoryTier,

    /// Size of the data in bytes (in current format).
    pub bytes: u64,

    /// Current data format.
    pub format: CacheFormat,

    /// Unix timestamp (ms) of the last reuse. Older means colder.
    pub last_access_ms: u64,

    /// Expected reuse hits per observation window.
    pub reuse_rate: f64,

    /// Pinned segments are never touched by the autopilot.
    #[serde(default)]
    pub pinned: bool,
}

impl SegmentInfo {
    /// Milliseconds since the last reuse, relative to `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_access_ms)
    }

    /// Bytes freed by quantizing one format step, or None if already at Q4.
    pub fn quantize_savings(&self) -> Option<u64> {
        let next = self.format.quantized()?;
        Some(self.bytes.saturating_sub(self.format.resize(self.bytes, next)))
    }
}
