//! Build-time registry of storage platforms.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, CompletedPart, PartInfo, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use depot_core::StorageConfig;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Platform-specific configuration check.
pub type ValidateFn = fn(&StorageConfig) -> Result<(), String>;

/// Builds a configured backend from a validated configuration.
pub type CreateFn = fn(StorageConfig) -> BoxFuture<'static, StorageResult<Arc<dyn StorageBackend>>>;

/// One row of the registration table.
#[derive(Clone, Copy, Debug)]
pub struct PlatformRegistration {
    pub platform: &'static str,
    pub description: &'static str,
    /// Smallest size the platform accepts for every part but the last.
    pub min_part_size: u64,
    pub validate: ValidateFn,
    pub create: CreateFn,
}

/// Unconfigured stand-in for a platform.
///
/// Carries the platform's metadata and factory functions. Every I/O
/// operation fails with [`StorageError::Unconfigured`].
#[derive(Debug)]
pub struct BackendPrototype {
    registration: PlatformRegistration,
}

impl BackendPrototype {
    pub fn description(&self) -> &'static str {
        self.registration.description
    }

    pub fn min_part_size(&self) -> u64 {
        self.registration.min_part_size
    }

    pub fn validate(&self, config: &StorageConfig) -> Result<(), String> {
        (self.registration.validate)(config)
    }

    pub async fn create(&self, config: StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        (self.registration.create)(config).await
    }

    fn unconfigured<T>(&self) -> StorageResult<T> {
        Err(StorageError::Unconfigured {
            platform: self.registration.platform.to_string(),
        })
    }
}

#[async_trait]
impl StorageBackend for BackendPrototype {
    fn platform(&self) -> &str {
        self.registration.platform
    }

    async fn upload(&self, _key: &str, _data: ByteStream) -> StorageResult<()> {
        self.unconfigured()
    }

    async fn download(&self, _key: &str) -> StorageResult<ByteStream> {
        self.unconfigured()
    }

    async fn download_range(&self, _key: &str, _start: u64, _end: u64) -> StorageResult<ByteStream> {
        self.unconfigured()
    }

    async fn delete(&self, _key: &str) -> StorageResult<()> {
        self.unconfigured()
    }

    async fn rename(&self, _key: &str, _new_name: &str) -> StorageResult<String> {
        self.unconfigured()
    }

    async fn get_url(&self, _key: &str, _expires_in: Option<Duration>) -> StorageResult<String> {
        self.unconfigured()
    }

    async fn exists(&self, _key: &str) -> StorageResult<bool> {
        self.unconfigured()
    }

    async fn initiate_multipart_upload(
        &self,
        _key: &str,
        _mime_type: Option<&str>,
    ) -> StorageResult<String> {
        self.unconfigured()
    }

    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        _part_number: u32,
        _size: u64,
        _data: Bytes,
    ) -> StorageResult<String> {
        self.unconfigured()
    }

    async fn list_parts(&self, _key: &str, _upload_id: &str) -> StorageResult<Vec<PartInfo>> {
        self.unconfigured()
    }

    async fn complete_multipart_upload(
        &self,
        _key: &str,
        _upload_id: &str,
        _parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.unconfigured()
    }

    async fn abort_multipart_upload(&self, _key: &str, _upload_id: &str) -> StorageResult<()> {
        self.unconfigured()
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.unconfigured()
    }
}

/// Platform identifier and description, for discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformInfo {
    pub platform: String,
    pub description: String,
}

/// Registry of available platforms, keyed by identifier.
pub struct PluginRegistry {
    prototypes: HashMap<&'static str, Arc<BackendPrototype>>,
}

impl PluginRegistry {
    /// Build a registry from a registration table.
    ///
    /// A platform identifier registered twice keeps its first registration.
    pub fn new(registrations: impl IntoIterator<Item = PlatformRegistration>) -> Self {
        let mut prototypes = HashMap::new();
        for registration in registrations {
            if prototypes.contains_key(registration.platform) {
                tracing::warn!(
                    platform = registration.platform,
                    "Duplicate storage platform registration ignored"
                );
                continue;
            }
            prototypes.insert(
                registration.platform,
                Arc::new(BackendPrototype { registration }),
            );
        }
        tracing::debug!(platforms = prototypes.len(), "Storage platform registry built");
        Self { prototypes }
    }

    /// Registry of every platform compiled into this crate.
    pub fn builtin() -> Self {
        Self::new(crate::backends::builtin_registrations())
    }

    pub fn get_prototype(&self, platform: &str) -> StorageResult<Arc<BackendPrototype>> {
        self.prototypes
            .get(platform)
            .cloned()
            .ok_or_else(|| StorageError::UnknownPlatform(platform.to_string()))
    }

    /// Registered platforms sorted by identifier.
    pub fn list_available_platforms(&self) -> Vec<PlatformInfo> {
        let mut platforms: Vec<_> = self
            .prototypes
            .values()
            .map(|p| PlatformInfo {
                platform: p.registration.platform.to_string(),
                description: p.registration.description.to_string(),
            })
            .collect();
        platforms.sort_by(|a, b| a.platform.cmp(&b.platform));
        platforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(_: &StorageConfig) -> Result<(), String> {
        Ok(())
    }

    fn reject(_: &StorageConfig) -> Result<(), String> {
        Err("second registration".to_string())
    }

    fn fail_create(_: StorageConfig) -> BoxFuture<'static, StorageResult<Arc<dyn StorageBackend>>> {
        Box::pin(async { Err(StorageError::Provider("not buildable".to_string())) })
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let registry = PluginRegistry::new([
            PlatformRegistration {
                platform: "mem",
                description: "first",
                min_part_size: 0,
                validate: accept,
                create: fail_create,
            },
            PlatformRegistration {
                platform: "mem",
                description: "second",
                min_part_size: 1,
                validate: reject,
                create: fail_create,
            },
        ]);

        let platforms = registry.list_available_platforms();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].description, "first");

        let prototype = registry.get_prototype("mem").unwrap();
        assert!(prototype.validate(&StorageConfig::default_local([])).is_ok());
        assert_eq!(prototype.min_part_size(), 0);
    }

    #[test]
    fn test_builtin_platforms_sorted() {
        let registry = PluginRegistry::builtin();
        let names: Vec<_> = registry
            .list_available_platforms()
            .into_iter()
            .map(|p| p.platform)
            .collect();
        assert_eq!(names, vec!["local", "s3"]);
        assert_eq!(registry.get_prototype("local").unwrap().min_part_size(), 0);
        assert_eq!(
            registry.get_prototype("s3").unwrap().min_part_size(),
            crate::backends::s3::MIN_PART_SIZE
        );
        assert!(matches!(
            registry.get_prototype("ftp"),
            Err(StorageError::UnknownPlatform(_))
        ));
    }

    #[tokio::test]
    async fn test_prototype_refuses_io() {
        let registry = PluginRegistry::builtin();
        let prototype = registry.get_prototype("local").unwrap();
        assert_eq!(prototype.platform(), "local");
        assert!(matches!(
            prototype.exists("k").await,
            Err(StorageError::Unconfigured { .. })
        ));
        assert!(matches!(
            prototype.initiate_multipart_upload("k", None).await,
            Err(StorageError::Unconfigured { .. })
        ));
        prototype.close().await.unwrap();
    }
}
