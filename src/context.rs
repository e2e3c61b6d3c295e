//! Process-wide engine state.
//!
//! The plugin catalog and the log-channel registry are shared by every
//! pipeline in the process. They live here, constructed once from the
//! [`EngineConfig`] and handed around as `Arc<EngineContext>`, so tests can
//! build as many isolated engines as they like.

use crate::config::EngineConfig;
use crate::registry::{LogChannelRegistry, PluginCatalog};

pub struct EngineContext {
    config: EngineConfig,
    plugins: PluginCatalog,
    log_channels: LogChannelRegistry,
}

impl EngineContext {
    pub fn new(config: &EngineConfig) -> Self {
        tracing::debug!(
            "Engine context created (channel capacity {}, log registry max {})",
            config.channel.default_capacity,
            config.logging.registry_max_size
        );
        Self {
            config: config.clone(),
            plugins: PluginCatalog::new(),
            log_channels: LogChannelRegistry::new(config.logging.registry_max_size),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plugins(&self) -> &PluginCatalog {
        &self.plugins
    }

    pub fn log_channels(&self) -> &LogChannelRegistry {
        &self.log_channels
    }

    /// Drop every plugin and log channel.
    pub fn shutdown(&self) {
        let plugins = self.plugins.clear();
        let channels = self.log_channels.clear();
        tracing::info!(
            "Engine shut down: released {} plugin id(s) and {} log channel(s)",
            plugins,
            channels
        );
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("plugins", &self.plugins)
            .field("log_channels", &self.log_channels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LoggingObjectType, LoggingSource, PluginDescriptor, PluginType};

    #[test]
    fn test_contexts_are_isolated() {
        let a = EngineContext::default();
        let b = EngineContext::default();
        a.plugins()
            .register(PluginDescriptor::new(PluginType::Step, "Dummy", "Dummy"))
            .unwrap();
        assert!(b.plugins().get(PluginType::Step, "Dummy").is_none());
    }

    #[test]
    fn test_shutdown_clears_registries() {
        let engine = EngineContext::default();
        engine
            .plugins()
            .register(PluginDescriptor::new(PluginType::Step, "Dummy", "Dummy"))
            .unwrap();
        engine
            .log_channels()
            .register(LoggingSource::new(LoggingObjectType::General, "engine"));
        engine.shutdown();
        assert_eq!(engine.plugins().id_count(), 0);
        assert!(engine.log_channels().is_empty());
    }

    #[test]
    fn test_registry_bound_comes_from_config() {
        let mut config = EngineConfig::default();
        config.logging.registry_max_size = 7;
        assert_eq!(EngineContext::new(&config).log_channels().max_size(), 7);
    }
}
