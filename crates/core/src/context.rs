//! Per-request context passed explicitly through engine calls.

use crate::storage_config::StorageConfig;

/// Who is calling and which storage configuration their request targets.
///
/// `storage: None` routes to the process-wide default backend.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub user_id: String,
    pub storage: Option<StorageConfig>,
}

impl RequestContext {
    /// Context for a user on the default backend.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            storage: None,
        }
    }

    /// Same context targeting a specific storage configuration.
    pub fn with_storage(mut self, config: StorageConfig) -> Self {
        self.storage = Some(config);
        self
    }

    /// Platform identifier the request resolves to.
    pub fn platform(&self) -> &str {
        self.storage
            .as_ref()
            .map(StorageConfig::platform)
            .unwrap_or(crate::DEFAULT_PLATFORM)
    }
}
