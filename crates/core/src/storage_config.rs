//! Storage backend configuration owned by a tenant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Platform identifier of the built-in local filesystem backend.
pub const DEFAULT_PLATFORM: &str = "local";

/// One tenant's configuration of a storage backend.
///
/// Immutable once built; a changed configuration is a new value that
/// replaces the old one in the instance cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    config_id: Uuid,
    platform: String,
    user_id: Option<String>,
    properties: BTreeMap<String, String>,
    enabled: bool,
}

impl StorageConfig {
    pub fn new(
        config_id: Uuid,
        platform: impl Into<String>,
        user_id: Option<String>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            config_id,
            platform: platform.into(),
            user_id,
            properties,
            enabled: true,
        }
    }

    /// A user-owned configuration with a fresh id.
    pub fn for_user(
        platform: impl Into<String>,
        user_id: impl Into<String>,
        properties: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self::new(
            Uuid::new_v4(),
            platform,
            Some(user_id.into()),
            properties.into_iter().collect(),
        )
    }

    /// The process-wide default backend's configuration.
    pub fn default_local(properties: impl IntoIterator<Item = (String, String)>) -> Self {
        Self::new(
            Uuid::nil(),
            DEFAULT_PLATFORM,
            None,
            properties.into_iter().collect(),
        )
    }

    /// Same configuration with the `enabled` flag replaced.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn config_id(&self) -> Uuid {
        self.config_id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Look up a property, treating blank values as absent.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether this is the default backend's configuration.
    pub fn is_default(&self) -> bool {
        self.config_id.is_nil()
    }

    /// Cache key: `{config_id}:{platform}:{user_id|-}`.
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.config_id,
            self.platform,
            self.user_id.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        let id = Uuid::parse_str("00000000-0000-0000-0000-000000000042").unwrap();
        let config = StorageConfig::new(id, "s3", Some("alice".into()), BTreeMap::new());
        assert_eq!(
            config.cache_key(),
            "00000000-0000-0000-0000-000000000042:s3:alice"
        );

        let config = StorageConfig::default_local([]);
        assert!(config.is_default());
        assert!(config.cache_key().ends_with(":local:-"));
    }

    #[test]
    fn test_blank_property_is_absent() {
        let config = StorageConfig::for_user(
            "s3",
            "u1",
            [
                ("bucket".to_string(), "b".to_string()),
                ("region".to_string(), "  ".to_string()),
            ],
        );
        assert_eq!(config.property("bucket"), Some("b"));
        assert_eq!(config.property("region"), None);
        assert!(config.enabled());
        assert!(!config.with_enabled(false).enabled());
    }
}
