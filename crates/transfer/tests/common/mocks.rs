use async_trait::async_trait;
use bytes::Bytes;
use depot_core::StorageConfig;
use depot_storage::backends::local;
use depot_storage::error::{StorageError, StorageResult};
use depot_storage::registry::PlatformRegistration;
use depot_storage::traits::{ByteStream, CompletedPart, PartInfo, StorageBackend};
use depot_storage::LocalBackend;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub const INSTRUMENTED_PLATFORM: &str = "instrumented";

/// Property selecting which [`CallCounts`] an instance reports to.
const COUNTERS_PROPERTY: &str = "counters";

/// Registered create functions cannot capture, so instances find their
/// counters here by id.
static REGISTERED_COUNTS: LazyLock<Mutex<HashMap<String, Arc<CallCounts>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Per-test counters of multipart calls.
#[derive(Default)]
#[allow(dead_code)]
pub struct CallCounts {
    pub initiate: AtomicUsize,
    pub upload_part: AtomicUsize,
    pub complete: AtomicUsize,
    pub abort: AtomicUsize,
    pub close: AtomicUsize,
    /// Make `complete_multipart_upload` fail.
    pub fail_complete: AtomicBool,
    /// Hold each stored part until `release_part` is notified.
    pub hold_parts: AtomicBool,
    /// Notified when a held part has been written.
    pub part_stored: Notify,
    pub release_part: Notify,
}

#[allow(dead_code)]
impl CallCounts {
    pub fn initiated(&self) -> usize {
        self.initiate.load(Ordering::SeqCst)
    }

    pub fn parts(&self) -> usize {
        self.upload_part.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.abort.load(Ordering::SeqCst)
    }
}

/// A user configuration for the instrumented platform, rooted under
/// `dir/<user>`, reporting to a fresh set of counters.
pub fn instrumented_config(dir: &Path, user: &str) -> (StorageConfig, Arc<CallCounts>) {
    let counters_id = Uuid::new_v4().to_string();
    let counts = Arc::new(CallCounts::default());
    REGISTERED_COUNTS
        .lock()
        .unwrap()
        .insert(counters_id.clone(), Arc::clone(&counts));
    let config = StorageConfig::for_user(
        INSTRUMENTED_PLATFORM,
        user,
        [
            (
                local::ROOT_PROPERTY.to_string(),
                dir.join(user).display().to_string(),
            ),
            (COUNTERS_PROPERTY.to_string(), counters_id),
        ],
    );
    (config, counts)
}

pub fn instrumented_registration() -> PlatformRegistration {
    PlatformRegistration {
        platform: INSTRUMENTED_PLATFORM,
        description: "Local filesystem with call counters (tests)",
        min_part_size: 0,
        validate,
        create,
    }
}

fn validate(config: &StorageConfig) -> Result<(), String> {
    for name in [local::ROOT_PROPERTY, COUNTERS_PROPERTY] {
        if config.property(name).is_none() {
            return Err(format!("missing required property '{name}'"));
        }
    }
    Ok(())
}

fn create(config: StorageConfig) -> BoxFuture<'static, StorageResult<Arc<dyn StorageBackend>>> {
    Box::pin(async move {
        let root = config.property(local::ROOT_PROPERTY).unwrap_or_default();
        let counters_id = config.property(COUNTERS_PROPERTY).unwrap_or_default();
        let counts = REGISTERED_COUNTS
            .lock()
            .unwrap()
            .get(counters_id)
            .cloned()
            .ok_or_else(|| StorageError::Provider(format!("unknown counters {counters_id}")))?;
        let inner = LocalBackend::new(root, None).await?;
        Ok(Arc::new(InstrumentedBackend { inner, counts }) as Arc<dyn StorageBackend>)
    })
}

/// Local backend that counts multipart calls.
pub struct InstrumentedBackend {
    inner: LocalBackend,
    counts: Arc<CallCounts>,
}

#[async_trait]
impl StorageBackend for InstrumentedBackend {
    fn platform(&self) -> &str {
        INSTRUMENTED_PLATFORM
    }

    async fn upload(&self, key: &str, data: ByteStream) -> StorageResult<()> {
        self.inner.upload(key, data).await
    }

    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.download(key).await
    }

    async fn download_range(&self, key: &str, start: u64, end: u64) -> StorageResult<ByteStream> {
        self.inner.download_range(key, start, end).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn rename(&self, key: &str, new_name: &str) -> StorageResult<String> {
        self.inner.rename(key, new_name).await
    }

    async fn get_url(&self, key: &str, expires_in: Option<Duration>) -> StorageResult<String> {
        self.inner.get_url(key, expires_in).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn initiate_multipart_upload(
        &self,
        key: &str,
        mime_type: Option<&str>,
    ) -> StorageResult<String> {
        self.counts.initiate.fetch_add(1, Ordering::SeqCst);
        self.inner.initiate_multipart_upload(key, mime_type).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        data: Bytes,
    ) -> StorageResult<String> {
        self.counts.upload_part.fetch_add(1, Ordering::SeqCst);
        let part_id = self
            .inner
            .upload_part(key, upload_id, part_number, size, data)
            .await?;
        if self.counts.hold_parts.load(Ordering::SeqCst) {
            self.counts.part_stored.notify_one();
            self.counts.release_part.notified().await;
        }
        Ok(part_id)
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> StorageResult<Vec<PartInfo>> {
        self.inner.list_parts(key, upload_id).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.counts.complete.fetch_add(1, Ordering::SeqCst);
        if self.counts.fail_complete.load(Ordering::SeqCst) {
            return Err(StorageError::Provider("injected completion failure".into()));
        }
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.counts.abort.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_multipart_upload(key, upload_id).await
    }

    async fn close(&self) -> StorageResult<()> {
        self.counts.close.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}
