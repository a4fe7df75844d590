//! Single entry point resolving a request to its storage backend.

use crate::cache::InstanceCache;
use crate::default::DefaultBackendManager;
use crate::error::{StorageError, StorageResult};
use crate::factory::InstanceFactory;
use crate::registry::{PlatformInfo, PluginRegistry};
use crate::traits::StorageBackend;
use depot_core::config::DefaultStorageSettings;
use depot_core::{RequestContext, StorageConfig};
use std::sync::Arc;
use uuid::Uuid;

/// Routes requests to the default backend or to a cached per-tenant instance.
pub struct StorageFacade {
    factory: InstanceFactory,
    cache: InstanceCache,
    default: DefaultBackendManager,
}

impl StorageFacade {
    pub fn new(registry: Arc<PluginRegistry>, default_settings: &DefaultStorageSettings) -> Self {
        let factory = InstanceFactory::new(registry);
        Self {
            default: DefaultBackendManager::new(factory.clone(), default_settings),
            factory,
            cache: InstanceCache::new(),
        }
    }

    /// Facade over every built-in platform.
    pub fn builtin(default_settings: &DefaultStorageSettings) -> Self {
        Self::new(Arc::new(PluginRegistry::builtin()), default_settings)
    }

    /// Backend for the request's storage configuration.
    ///
    /// No configuration, or the default one, resolves to the default backend.
    /// A configuration owned by someone other than the caller is refused.
    pub async fn current(&self, ctx: &RequestContext) -> StorageResult<Arc<dyn StorageBackend>> {
        match &ctx.storage {
            None => self.default.get_instance().await,
            Some(config) if config.is_default() => self.default.get_instance().await,
            Some(config) => {
                if config.user_id() != Some(ctx.user_id.as_str()) {
                    return Err(StorageError::PermissionDenied(format!(
                        "storage configuration {} does not belong to user {}",
                        config.config_id(),
                        ctx.user_id
                    )));
                }
                self.by_config(config).await
            }
        }
    }

    /// Cached instance for an explicit configuration, without an ownership check.
    pub async fn by_config(&self, config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        if config.is_default() {
            return self.default.get_instance().await;
        }
        self.cache
            .get_or_create(config, || self.factory.create(config))
            .await
    }

    /// Smallest non-final part size `platform` accepts.
    pub fn min_part_size(&self, platform: &str) -> StorageResult<u64> {
        Ok(self.factory.registry().get_prototype(platform)?.min_part_size())
    }

    pub fn available_platforms(&self) -> Vec<PlatformInfo> {
        self.factory.registry().list_available_platforms()
    }

    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub fn default_manager(&self) -> &DefaultBackendManager {
        &self.default
    }

    /// Drop the cached instance of an updated or deleted configuration.
    pub async fn invalidate_config(&self, config_id: Uuid) -> bool {
        self.cache.invalidate_by_config_id(config_id).await
    }

    pub async fn invalidate_user(&self, user_id: &str) -> usize {
        self.cache.invalidate_user(user_id).await
    }

    /// Close every live instance, the default backend included.
    pub async fn shutdown(&self) {
        let evicted = self.cache.clear().await;
        self.default.destroy().await;
        tracing::info!(evicted, "Storage facade shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::ROOT_PROPERTY;

    fn facade(dir: &std::path::Path) -> StorageFacade {
        StorageFacade::builtin(&DefaultStorageSettings {
            path: dir.join("default"),
            public_url: None,
        })
    }

    fn user_config(dir: &std::path::Path, user: &str) -> StorageConfig {
        StorageConfig::for_user(
            "local",
            user,
            [(ROOT_PROPERTY.to_string(), dir.join(user).display().to_string())],
        )
    }

    #[tokio::test]
    async fn test_no_config_routes_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade(dir.path());

        let a = facade.current(&RequestContext::new("u1")).await.unwrap();
        let b = facade.current(&RequestContext::new("u2")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(facade.default_manager().is_created());
        assert!(facade.cache().is_empty());
    }

    #[test]
    fn test_min_part_size_per_platform() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade(dir.path());
        assert_eq!(facade.min_part_size("local").unwrap(), 0);
        assert_eq!(facade.min_part_size("s3").unwrap(), 5 * 1024 * 1024);
        assert!(matches!(
            facade.min_part_size("ftp"),
            Err(StorageError::UnknownPlatform(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_config_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade(dir.path());
        let ctx = RequestContext::new("u2").with_storage(user_config(dir.path(), "u1"));

        assert!(matches!(
            facade.current(&ctx).await,
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(facade.cache().is_empty());
    }

    #[tokio::test]
    async fn test_user_config_is_cached_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade(dir.path());
        let config = user_config(dir.path(), "u1");
        let ctx = RequestContext::new("u1").with_storage(config.clone());

        let first = facade.current(&ctx).await.unwrap();
        let second = facade.current(&ctx).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(facade.invalidate_config(config.config_id()).await);
        assert!(!facade.invalidate_config(config.config_id()).await);
        assert!(matches!(
            first.exists("k").await,
            Err(StorageError::Closed { .. })
        ));

        let third = facade.current(&ctx).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        facade.shutdown().await;
        assert!(facade.cache().is_empty());
        assert!(!facade.default_manager().is_created());
    }
}
