//! Builds configured backend instances from storage configurations.

use crate::error::{StorageError, StorageResult};
use crate::registry::PluginRegistry;
use crate::traits::StorageBackend;
use depot_core::StorageConfig;
use std::sync::Arc;
use tracing::instrument;

/// Validates a configuration and builds a fresh backend from it.
///
/// Never caches; every call constructs a new instance. Failures of any
/// stage surface as [`StorageError::Configuration`].
#[derive(Clone)]
pub struct InstanceFactory {
    registry: Arc<PluginRegistry>,
}

impl InstanceFactory {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    #[instrument(skip(self, config), fields(platform = %config.platform(), config_id = %config.config_id()))]
    pub async fn create(&self, config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        let platform = config.platform().trim();
        Self::validate_generic(config).map_err(|message| StorageError::Configuration {
            platform: platform.to_string(),
            message,
        })?;

        let prototype = self
            .registry
            .get_prototype(platform)
            .map_err(|e| StorageError::Configuration {
                platform: platform.to_string(),
                message: e.to_string(),
            })?;
        prototype
            .validate(config)
            .map_err(|message| StorageError::Configuration {
                platform: platform.to_string(),
                message,
            })?;

        let instance = prototype.create(config.clone()).await.map_err(|e| match e {
            already @ StorageError::Configuration { .. } => already,
            other => StorageError::Configuration {
                platform: platform.to_string(),
                message: other.to_string(),
            },
        })?;

        tracing::info!(cache_key = %config.cache_key(), "Created storage backend instance");
        Ok(instance)
    }

    fn validate_generic(config: &StorageConfig) -> Result<(), String> {
        if config.platform().trim().is_empty() {
            return Err("platform must not be blank".to_string());
        }
        if !config.enabled() {
            return Err("storage configuration is disabled".to_string());
        }
        if let Some((name, _)) = config.properties().iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(format!("property '{name}' must not be blank"));
        }
        if !config.is_default() && config.user_id().is_none_or(|u| u.trim().is_empty()) {
            return Err("user storage configuration requires an owning user".to_string());
        }
        Ok(())
    }
}
