//! Explicit provider registry.
//!
//! Providers are registered by name at startup by whoever owns the process
//! (normally `main`). The registry is then shared read-only with the
//! controller; there is no discovery and no global instance.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::autopilot::plan::ActionKind;
use crate::providers::{CapabilityProvider, PluginType, ProviderError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Provider already registered: {0}")]
    DuplicateName(String),

    #[error("Provider {name} failed to start: {source}")]
    Startup {
        name: String,
        #[source]
        source: ProviderError,
    },
}

/// Registration options, usually taken from the `providers` config section.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub enabled: bool,
    /// Higher priority wins when several providers serve the same kind.
    pub priority: i32,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 0,
        }
    }
}

struct Entry {
    provider: Arc<dyn CapabilityProvider>,
    registration: Registration,
    /// Registration order, used as a stable tie-break.
    seq: usize,
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: HashMap<String, Entry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name.
    pub fn register(
        &mut self,
        provider: Arc<dyn CapabilityProvider>,
        registration: Registration,
    ) -> Result<(), RegistryError> {
        let name = provider.name().to_string();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        info!(
            provider = %name,
            plugin_type = %provider.plugin_type(),
            enabled = registration.enabled,
            priority = registration.priority,
            "Registered capability provider"
        );

        let seq = self.entries.len();
        self.entries.insert(
            name,
            Entry {
                provider,
                registration,
                seq,
            },
        );
        Ok(())
    }

    /// Get a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityProvider>> {
        self.entries.get(name).map(|e| e.provider.clone())
    }

    /// Enabled providers of a plugin type, highest priority first.
    pub fn providers_of(&self, plugin_type: PluginType) -> Vec<Arc<dyn CapabilityProvider>> {
        let mut matching: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.registration.enabled && e.provider.plugin_type() == plugin_type)
            .collect();
        matching.sort_by(|a, b| {
            b.registration
                .priority
                .cmp(&a.registration.priority)
                .then(a.seq.cmp(&b.seq))
        });
        matching.into_iter().map(|e| e.provider.clone()).collect()
    }

    /// The provider that executes actions of the given kind.
    pub fn provider_for(
        &self,
        kind: ActionKind,
    ) -> Result<Arc<dyn CapabilityProvider>, ProviderError> {
        self.providers_of(PluginType::for_action(kind))
            .into_iter()
            .next()
            .ok_or(ProviderError::NoProvider(kind))
    }

    /// Number of registered providers (enabled or not).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `on_startup` on every enabled provider; the first failure aborts startup.
    pub async fn startup_all(&self) -> Result<(), RegistryError> {
        let enabled: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.registration.enabled)
            .collect();

        let results = join_all(enabled.iter().map(|(_, e)| e.provider.on_startup())).await;
        for ((name, _), result) in enabled.iter().zip(results) {
            if let Err(source) = result {
                return Err(RegistryError::Startup {
                    name: (*name).clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Run `on_shutdown` on every enabled provider. Failures are logged, not returned.
    pub async fn shutdown_all(&self) {
        for (name, entry) in &self.entries {
            if !entry.registration.enabled {
                continue;
            }
            if let Err(e) = entry.provider.on_shutdown().await {
                warn!(provider = %name, error = %e, "Provider shutdown failed");
            }
        }
    }

    /// Health metrics of every registered provider, keyed by provider name.
    pub fn health(&self) -> HashMap<String, HashMap<String, f64>> {
        self.entries
            .iter()
            .map(|(name, e)| (name.clone(), e.provider.health_metrics()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Named(&'static str, PluginType);

    #[async_trait]
    impl CapabilityProvider for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn plugin_type(&self) -> PluginType {
            self.1
        }
    }

    fn registration(enabled: bool, priority: i32) -> Registration {
        Registration { enabled, priority }
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(Named("lmcache", PluginType::KvCache)), Registration::default())
            .unwrap();
        let err = registry
            .register(Arc::new(Named("lmcache", PluginType::KvCache)), Registration::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(n) if n == "lmcache"));
    }

    #[test]
    fn test_provider_for_prefers_priority_and_skips_disabled() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(Named("low", PluginType::Quantization)), registration(true, 1))
            .unwrap();
        registry
            .register(Arc::new(Named("high", PluginType::Quantization)), registration(true, 5))
            .unwrap();
        registry
            .register(Arc::new(Named("off", PluginType::Quantization)), registration(false, 99))
            .unwrap();

        let p = registry.provider_for(ActionKind::Quantize).unwrap();
        assert_eq!(p.name(), "high");
    }

    #[test]
    fn test_provider_for_missing_kind() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(Named("kivi", PluginType::Quantization)), Registration::default())
            .unwrap();
        let err = registry.provider_for(ActionKind::Evict).err().unwrap();
        assert_eq!(err, ProviderError::NoProvider(ActionKind::Evict));
    }

    #[tokio::test]
    async fn test_default_operations_are_unsupported() {
        let p = Named("monitor", PluginType::Other);
        let err = p.evict(&"seg".into()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { operation: "evict", .. }));
        assert!(matches!(
            p.dequantize(&"seg".into()).await,
            Err(ProviderError::NotReversible(_))
        ));
    }
}
