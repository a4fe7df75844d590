//! Process-wide state shared by every request.

use anyhow::{Context, Result};
use depot_core::config::AppConfig;
use depot_metadata::MetadataStore;
use depot_storage::StorageFacade;
use depot_transfer::{BroadcastSink, TransferEngine};
use std::sync::Arc;

/// Capacity of the event channel. Subscribers further behind lose events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    pub storage: Arc<StorageFacade>,
    pub engine: Arc<TransferEngine>,
    pub events: BroadcastSink,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<StorageFacade>,
    ) -> Self {
        let events = BroadcastSink::new(EVENT_CHANNEL_CAPACITY);
        let engine = Arc::new(TransferEngine::new(
            config.transfer.clone(),
            Arc::clone(&metadata),
            Arc::clone(&storage),
            Arc::new(events.clone()),
        ));
        Self {
            config: Arc::new(config),
            metadata,
            storage,
            engine,
            events,
        }
    }

    /// Validate the configuration, open the metadata store and verify the
    /// default backend before accepting work.
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid configuration")?;

        let metadata = depot_metadata::from_config(&config.metadata)
            .await
            .context("failed to initialize metadata store")?;
        metadata
            .health_check()
            .await
            .context("metadata store health check failed")?;
        tracing::info!("Metadata store initialized");

        let storage = Arc::new(StorageFacade::builtin(&config.storage));
        let platforms: Vec<String> = storage
            .available_platforms()
            .into_iter()
            .map(|p| p.platform)
            .collect();
        tracing::info!(platforms = ?platforms, "Storage platforms registered");

        storage
            .default_manager()
            .get_instance()
            .await
            .context("failed to initialize default storage")?
            .health_check()
            .await
            .context("default storage health check failed")?;
        tracing::info!(path = %config.storage.path.display(), "Default storage verified");

        Ok(Self::new(config, metadata, storage))
    }

    /// Close every backend instance.
    pub async fn shutdown(&self) {
        self.storage.shutdown().await;
    }
}
