//! Capability providers: the backends that actually evict or quantize segments.
//!
//! - [`registry`]: explicit name → provider registry built at startup
//!
//! The autopilot only talks to backends through [`CapabilityProvider`]. A
//! provider reports what it freed and whether the change can be undone; the
//! executor uses that to decide how (and whether) a revert is possible.

pub mod registry;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::autopilot::plan::ActionKind;
use crate::cache::segment::SegmentRef;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider {provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("Segment not found: {0}")]
    SegmentNotFound(SegmentRef),

    #[error("Segment {0} cannot be restored to its previous representation")]
    NotReversible(SegmentRef),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("No enabled provider registered for {0} actions")]
    NoProvider(ActionKind),
}

/// Kind of plugin a provider implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginType {
    /// Reuse cache backends; serve EVICT actions.
    KvCache,
    /// Quantization codecs; serve QUANTIZE actions.
    Quantization,
    Other,
}

impl PluginType {
    /// The plugin type responsible for a given action kind.
    pub fn for_action(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Evict => PluginType::KvCache,
            ActionKind::Quantize => PluginType::Quantization,
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginType::KvCache => write!(f, "KV_CACHE"),
            PluginType::Quantization => write!(f, "QUANTIZATION"),
            PluginType::Other => write!(f, "OTHER"),
        }
    }
}

/// Result of a successful eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictOutcome {
    pub freed_bytes: u64,
    /// Whether the provider kept enough state to restore the segment.
    pub restorable: bool,
}

/// Result of a successful quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizeOutcome {
    pub freed_bytes: u64,
    /// Whether the pre-quantization representation was retained.
    pub reversible: bool,
}

/// A concrete cache/quantization backend.
///
/// Providers implement only the operations their plugin type supports; the
/// defaults report [`ProviderError::Unsupported`].
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn name(&self) -> &str;

    fn plugin_type(&self) -> PluginType;

    async fn on_startup(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn health_metrics(&self) -> HashMap<String, f64> {
        HashMap::new()
    }

    async fn evict(&self, _segment: &SegmentRef) -> Result<EvictOutcome, ProviderError> {
        Err(self.unsupported("evict"))
    }

    async fn quantize(&self, _segment: &SegmentRef) -> Result<QuantizeOutcome, ProviderError> {
        Err(self.unsupported("quantize"))
    }

    /// Undo an eviction previously reported as restorable.
    async fn restore(&self, segment: &SegmentRef) -> Result<(), ProviderError> {
        Err(ProviderError::NotReversible(segment.clone()))
    }

    /// Undo a quantization previously reported as reversible.
    async fn dequantize(&self, segment: &SegmentRef) -> Result<(), ProviderError> {
        Err(ProviderError::NotReversible(segment.clone()))
    }

    fn unsupported(&self, operation: &'static str) -> ProviderError {
        ProviderError::Unsupported {
            provider: self.name().to_string(),
            operation,
        }
    }
}
