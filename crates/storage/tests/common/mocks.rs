use async_trait::async_trait;
use bytes::Bytes;
use depot_storage::error::{StorageError, StorageResult};
use depot_storage::traits::{ByteStream, CompletedPart, PartInfo, StorageBackend};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Backend that stores nothing and counts close calls.
#[allow(dead_code)]
pub struct CountingBackend {
    pub closes: AtomicUsize,
}

#[allow(dead_code)]
impl CountingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            closes: AtomicUsize::new(0),
        })
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Build a backend after `build_delay`, bumping `builds`. The delay
    /// stretches construction so racing callers overlap.
    pub async fn build(
        builds: &AtomicUsize,
        build_delay: Duration,
    ) -> StorageResult<Arc<dyn StorageBackend>> {
        builds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(build_delay).await;
        Ok(Self::new())
    }

    fn unsupported<T>() -> StorageResult<T> {
        Err(StorageError::Provider(
            "counting backend stores nothing".to_string(),
        ))
    }
}

#[async_trait]
impl StorageBackend for CountingBackend {
    fn platform(&self) -> &str {
        "counting"
    }

    async fn upload(&self, _key: &str, _data: ByteStream) -> StorageResult<()> {
        Self::unsupported()
    }

    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn download_range(&self, key: &str, _start: u64, _end: u64) -> StorageResult<ByteStream> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, _key: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn rename(&self, key: &str, _new_name: &str) -> StorageResult<String> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn get_url(&self, _key: &str, _expires_in: Option<Duration>) -> StorageResult<String> {
        Self::unsupported()
    }

    async fn exists(&self, _key: &str) -> StorageResult<bool> {
        Ok(false)
    }

    async fn initiate_multipart_upload(
        &self,
        _key: &str,
        _mime_type: Option<&str>,
    ) -> StorageResult<String> {
        Self::unsupported()
    }

    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        _part_number: u32,
        _size: u64,
        _data: Bytes,
    ) -> StorageResult<String> {
        Self::unsupported()
    }

    async fn list_parts(&self, _key: &str, _upload_id: &str) -> StorageResult<Vec<PartInfo>> {
        Ok(Vec::new())
    }

    async fn complete_multipart_upload(
        &self,
        _key: &str,
        _upload_id: &str,
        _parts: &[CompletedPart],
    ) -> StorageResult<()> {
        Self::unsupported()
    }

    async fn abort_multipart_upload(&self, _key: &str, _upload_id: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
