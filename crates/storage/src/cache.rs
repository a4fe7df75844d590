//! Cache of live backend instances keyed by tenant configuration.

use crate::error::StorageResult;
use crate::traits::StorageBackend;
use dashmap::DashMap;
use depot_core::StorageConfig;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Number of striped construction locks.
const LOCK_STRIPES: usize = 64;

struct CacheEntry {
    instance: Arc<dyn StorageBackend>,
    config_id: Uuid,
    user_id: Option<String>,
}

/// Holds one live instance per cache key.
///
/// Construction for a key is serialized through one of [`LOCK_STRIPES`]
/// async mutexes chosen by key hash, so racing callers for the same key
/// build once while unrelated keys proceed independently. Evicted instances
/// are closed exactly once.
pub struct InstanceCache {
    entries: DashMap<String, CacheEntry>,
    by_config: DashMap<Uuid, String>,
    stripes: Box<[Mutex<()>]>,
}

impl Default for InstanceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_config: DashMap::new(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn lookup(&self, key: &str) -> Option<Arc<dyn StorageBackend>> {
        self.entries.get(key).map(|e| Arc::clone(&e.instance))
    }

    /// Return the cached instance for `config`, building it with `creator`
    /// on a miss. A failed build caches nothing.
    pub async fn get_or_create<F, Fut>(
        &self,
        config: &StorageConfig,
        creator: F,
    ) -> StorageResult<Arc<dyn StorageBackend>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<Arc<dyn StorageBackend>>>,
    {
        let key = config.cache_key();
        if let Some(instance) = self.lookup(&key) {
            return Ok(instance);
        }

        let (instance, stale) = {
            let _guard = self.stripe(&key).lock().await;
            if let Some(instance) = self.lookup(&key) {
                return Ok(instance);
            }

            let instance = creator().await?;
            self.entries.insert(
                key.clone(),
                CacheEntry {
                    instance: Arc::clone(&instance),
                    config_id: config.config_id(),
                    user_id: config.user_id().map(str::to_string),
                },
            );
            let previous = self.by_config.insert(config.config_id(), key.clone());
            tracing::debug!(cache_key = %key, "Cached storage backend instance");
            (instance, previous.filter(|old| *old != key))
        };

        // A config id re-pointed at a new key leaves the old instance stale.
        if let Some(old_key) = stale {
            self.evict(&old_key).await;
        }
        Ok(instance)
    }

    /// Remove and close the instance under `key`. Returns whether one was cached.
    pub async fn invalidate(&self, key: &str) -> bool {
        let _guard = self.stripe(key).lock().await;
        self.evict_locked(key).await
    }

    pub async fn invalidate_by_config_id(&self, config_id: Uuid) -> bool {
        let key = self.by_config.get(&config_id).map(|k| k.value().clone());
        match key {
            Some(key) => self.invalidate(&key).await,
            None => false,
        }
    }

    /// Invalidate several keys. Returns how many instances were evicted.
    pub async fn invalidate_many<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut evicted = 0;
        for key in keys {
            if self.invalidate(key.as_ref()).await {
                evicted += 1;
            }
        }
        evicted
    }

    pub async fn invalidate_by_config_ids(&self, config_ids: impl IntoIterator<Item = Uuid>) -> usize {
        let mut evicted = 0;
        for id in config_ids {
            if self.invalidate_by_config_id(id).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Evict every instance owned by `user_id`.
    pub async fn invalidate_user(&self, user_id: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .map(|e| e.key().clone())
            .collect();
        self.invalidate_many(keys).await
    }

    /// Evict everything.
    pub async fn clear(&self) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let evicted = self.invalidate_many(keys).await;
        tracing::info!(evicted, "Cleared storage backend cache");
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    async fn evict(&self, key: &str) -> bool {
        let _guard = self.stripe(key).lock().await;
        self.evict_locked(key).await
    }

    /// Caller holds the stripe lock for `key`.
    async fn evict_locked(&self, key: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        self.by_config
            .remove_if(&entry.config_id, |_, indexed| indexed == key);

        if let Err(e) = entry.instance.close().await {
            tracing::warn!(cache_key = %key, error = %e, "Failed to close evicted storage backend");
        } else {
            tracing::debug!(cache_key = %key, "Evicted storage backend instance");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PluginRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(user: &str) -> StorageConfig {
        StorageConfig::for_user("local", user, [("root".to_string(), "/unused".to_string())])
    }

    fn prototype() -> Arc<dyn StorageBackend> {
        PluginRegistry::builtin().get_prototype("local").unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_caches() {
        let cache = InstanceCache::new();
        let config = config("u1");
        let counter = AtomicUsize::new(0);
        let built = &counter;

        for _ in 0..3 {
            cache
                .get_or_create(&config, move || async move {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(prototype())
                })
                .await
                .unwrap();
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(cache.contains(&config.cache_key()));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let cache = InstanceCache::new();
        let config = config("u1");
        let result = cache
            .get_or_create(&config, || async {
                Err(crate::StorageError::Provider("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_user_only_touches_that_user() {
        let cache = InstanceCache::new();
        for user in ["u1", "u1", "u2"] {
            cache
                .get_or_create(&config(user), || async { Ok(prototype()) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.invalidate_user("u1").await, 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear().await, 1);
        assert!(cache.is_empty());
    }
}
