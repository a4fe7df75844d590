//! Process-wide default backend.

use crate::backends::local::{PUBLIC_URL_PROPERTY, ROOT_PROPERTY};
use crate::error::StorageResult;
use crate::factory::InstanceFactory;
use crate::traits::StorageBackend;
use depot_core::StorageConfig;
use depot_core::config::DefaultStorageSettings;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Lazily builds and owns the default local backend.
///
/// The `created` flag answers the fast path; construction and teardown
/// serialize on `init`.
pub struct DefaultBackendManager {
    factory: InstanceFactory,
    config: StorageConfig,
    created: AtomicBool,
    init: Mutex<()>,
    instance: RwLock<Option<Arc<dyn StorageBackend>>>,
}

impl DefaultBackendManager {
    pub fn new(factory: InstanceFactory, settings: &DefaultStorageSettings) -> Self {
        let mut properties = vec![(
            ROOT_PROPERTY.to_string(),
            settings.path.display().to_string(),
        )];
        if let Some(url) = &settings.public_url {
            properties.push((PUBLIC_URL_PROPERTY.to_string(), url.clone()));
        }
        Self {
            factory,
            config: StorageConfig::default_local(properties),
            created: AtomicBool::new(false),
            init: Mutex::new(()),
            instance: RwLock::new(None),
        }
    }

    /// The default backend's configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Get the default backend, building it on first use.
    pub async fn get_instance(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        if self.created.load(Ordering::Acquire)
            && let Some(instance) = self.instance.read().await.as_ref()
        {
            return Ok(Arc::clone(instance));
        }

        let _guard = self.init.lock().await;
        if let Some(instance) = self.instance.read().await.as_ref() {
            return Ok(Arc::clone(instance));
        }

        let instance = self.factory.create(&self.config).await?;
        *self.instance.write().await = Some(Arc::clone(&instance));
        self.created.store(true, Ordering::Release);
        tracing::info!("Default storage backend created");
        Ok(instance)
    }

    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    /// Close and drop the default backend. A later `get_instance` rebuilds it.
    pub async fn destroy(&self) {
        let _guard = self.init.lock().await;
        self.created.store(false, Ordering::Release);
        let Some(instance) = self.instance.write().await.take() else {
            return;
        };
        if let Err(e) = instance.close().await {
            tracing::warn!(error = %e, "Failed to close default storage backend");
        }
        tracing::info!("Default storage backend destroyed");
    }
}
