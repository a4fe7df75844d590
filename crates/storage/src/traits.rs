//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Maximum range size for `download_range` (128 MiB).
pub const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// A part stored under an in-progress multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartInfo {
    /// 1-based part number.
    pub part_number: u32,
    /// Provider part identifier (ETag).
    pub part_id: String,
    pub size: u64,
}

/// A part reference handed to `complete_multipart_upload`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub part_id: String,
}

/// Uniform operation contract over every storage provider.
///
/// Instances are shared as `Arc<dyn StorageBackend>` and must tolerate
/// concurrent calls. After `close()` every operation fails with
/// [`StorageError::Closed`].
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Platform identifier this backend was registered under.
    fn platform(&self) -> &str;

    /// Store an object, overwriting any existing one.
    async fn upload(&self, key: &str, data: ByteStream) -> StorageResult<()>;

    /// Stream an object's content.
    async fn download(&self, key: &str) -> StorageResult<ByteStream>;

    /// Stream the half-open byte range `[start, end)` of an object.
    async fn download_range(&self, key: &str, start: u64, end: u64) -> StorageResult<ByteStream>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Rename the last segment of `key` to `new_name`, returning the new key.
    async fn rename(&self, key: &str, new_name: &str) -> StorageResult<String>;

    /// URL for reading an object. `None` asks for a non-expiring URL.
    async fn get_url(&self, key: &str, expires_in: Option<Duration>) -> StorageResult<String>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Begin a multipart upload and return its provider handle.
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        mime_type: Option<&str>,
    ) -> StorageResult<String>;

    /// Store one part. `size` must equal `data.len()`. Returns the part id.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        data: Bytes,
    ) -> StorageResult<String>;

    /// Parts stored so far, sorted by part number.
    async fn list_parts(&self, key: &str, upload_id: &str) -> StorageResult<Vec<PartInfo>>;

    /// Assemble the parts into the final object. Parts must be listed in
    /// ascending order and each must match a stored part id.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Release resources held by this instance. Calling it twice is a no-op.
    async fn close(&self) -> StorageResult<()>;

    /// Verify the backend is reachable and properly configured.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// need no connectivity check.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Wrap in-memory bytes as a single-item [`ByteStream`].
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a [`ByteStream`] into memory.
pub async fn collect_stream(mut stream: ByteStream) -> StorageResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Validate a `[start, end)` range request.
pub(crate) fn check_range(start: u64, end: u64) -> StorageResult<u64> {
    if end < start {
        return Err(StorageError::InvalidRange(format!(
            "end ({end}) < start ({start})"
        )));
    }
    let len = end - start;
    if len > MAX_RANGE_SIZE {
        return Err(StorageError::InvalidRange(format!(
            "range size {len} exceeds maximum {MAX_RANGE_SIZE} bytes"
        )));
    }
    Ok(len)
}

/// Validate the part list of a completion request.
pub(crate) fn check_completed_parts(parts: &[CompletedPart]) -> StorageResult<()> {
    if parts.is_empty() {
        return Err(StorageError::InvalidPart(
            "complete multipart upload requires at least one part".to_string(),
        ));
    }
    let mut previous = 0;
    for part in parts {
        if part.part_number == 0 || part.part_number <= previous {
            return Err(StorageError::InvalidPart(
                "parts must be listed in ascending order starting at 1".to_string(),
            ));
        }
        previous = part.part_number;
    }
    Ok(())
}

/// Replace the last `/`-separated segment of `key` with `new_name`.
pub(crate) fn renamed_key(key: &str, new_name: &str) -> StorageResult<String> {
    if new_name.is_empty() || new_name.contains('/') || new_name == "." || new_name == ".." {
        return Err(StorageError::InvalidKey(format!(
            "new name must be a single path segment: {new_name}"
        )));
    }
    Ok(match key.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/{new_name}"),
        None => new_name.to_string(),
    })
}
