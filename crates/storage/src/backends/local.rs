//! Local filesystem storage backend.

use super::{Lifecycle, encode_key, validate_public_url};
use crate::error::{StorageError, StorageResult};
use crate::registry::PlatformRegistration;
use crate::traits::{
    ByteStream, CompletedPart, PartInfo, StorageBackend, check_completed_parts, check_range,
    renamed_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use depot_core::{ContentHash, StorageConfig};
use futures::StreamExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::instrument;
use uuid::Uuid;

/// Platform identifier.
pub const PLATFORM: &str = "local";

/// Property naming the root directory.
pub const ROOT_PROPERTY: &str = "root";

/// Property naming the base URL the root directory is served under.
pub const PUBLIC_URL_PROPERTY: &str = "public_url";

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Directory under the root holding in-progress multipart uploads.
const MULTIPART_DIR: &str = ".multipart";
const MULTIPART_META_FILE: &str = "upload.json";
const PART_FILE_PREFIX: &str = "part-";

#[derive(Debug, Serialize, Deserialize)]
struct MultipartMeta {
    key: String,
    mime_type: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    initiated: OffsetDateTime,
}

/// Local filesystem backend.
pub struct LocalBackend {
    root: PathBuf,
    public_url: Option<String>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("root", &self.root)
            .field("public_url", &self.public_url)
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>, public_url: Option<String>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            public_url: public_url.map(|u| u.trim_end_matches('/').to_string()),
            lifecycle: Lifecycle::new(PLATFORM),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the full path for a key, with path traversal protection.
    ///
    /// Runs the blocking `canonicalize`/`symlink_metadata` checks on the
    /// blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Returns an error if the key would escape the storage root, including
    /// through symlinks, or if it names the reserved multipart area.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }

        if key == MULTIPART_DIR || key.starts_with(&format!("{MULTIPART_DIR}/")) {
            return Err(StorageError::InvalidKey(format!("reserved key: {key}")));
        }

        let path = root.join(key);

        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Existing paths (or dangling symlinks) must resolve inside the root.
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!(
                            "symlink target missing or invalid: {key}"
                        ))
                    } else {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize path: {e}"),
                        ))
                    }
                })?;

                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StorageError::Io(std::io::Error::new(
                    err.kind(),
                    format!("failed to stat path: {err}"),
                )));
            }
        }

        // New paths: the nearest existing ancestor must resolve inside the root,
        // so create_dir_all never follows a symlinked directory out of it.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(meta) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "ancestor symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(std::io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize ancestor: {e}"),
                            ))
                        }
                    })?;

                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(std::io::Error::new(
                        err.kind(),
                        format!("failed to stat ancestor: {err}"),
                    )));
                }
            }
            ancestor = parent;
        }

        Ok(path)
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Sibling temp path with a unique suffix, so concurrent writers of the
    /// same key never share a temp file.
    fn temp_path(path: &Path) -> PathBuf {
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        )
    }

    /// Write a stream to `path` via temp file, fsync and rename.
    async fn write_atomic(path: &Path, mut data: ByteStream) -> StorageResult<u64> {
        Self::ensure_parent(path).await?;
        let temp_path = Self::temp_path(path);
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut written = 0u64;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok::<_, StorageError>(written)
        }
        .await;

        match result {
            Ok(written) => {
                fs::rename(&temp_path, path).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    fn not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        }
    }

    /// Directory of a multipart upload. Upload ids are UUIDs we minted, so
    /// anything else cannot name an upload.
    fn multipart_dir(&self, upload_id: &str) -> StorageResult<PathBuf> {
        let id = Uuid::parse_str(upload_id)
            .map_err(|_| StorageError::NotFound(format!("multipart upload {upload_id}")))?;
        Ok(self.root.join(MULTIPART_DIR).join(id.to_string()))
    }

    async fn read_meta(&self, key: &str, upload_id: &str) -> StorageResult<PathBuf> {
        let dir = self.multipart_dir(upload_id)?;
        let raw = fs::read(dir.join(MULTIPART_META_FILE)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(format!("multipart upload {upload_id}"))
            } else {
                StorageError::Io(e)
            }
        })?;
        let meta: MultipartMeta = serde_json::from_slice(&raw).map_err(|e| {
            StorageError::Io(std::io::Error::other(format!(
                "corrupt multipart metadata for {upload_id}: {e}"
            )))
        })?;
        if meta.key != key {
            return Err(StorageError::InvalidPart(format!(
                "upload {upload_id} does not belong to key {key}"
            )));
        }
        Ok(dir)
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("{PART_FILE_PREFIX}{part_number}"))
    }

    /// SHA-256 hex and length of a file, read in streaming fashion.
    async fn hash_file(path: &Path) -> StorageResult<(String, u64)> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = ContentHash::hasher();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok((hasher.finalize().to_hex(), size))
    }

    async fn stored_parts(dir: &Path) -> StorageResult<Vec<PartInfo>> {
        let mut entries = fs::read_dir(dir).await?;
        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(number) = name.strip_prefix(PART_FILE_PREFIX) else {
                continue;
            };
            // Skips in-flight temp files such as "part-3.tmp.<uuid>".
            let Ok(part_number) = number.parse::<u32>() else {
                continue;
            };
            let (part_id, size) = Self::hash_file(&entry.path()).await?;
            parts.push(PartInfo {
                part_number,
                part_id,
                size,
            });
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn platform(&self) -> &str {
        PLATFORM
    }

    #[instrument(skip(self, data), fields(backend = "local"))]
    async fn upload(&self, key: &str, data: ByteStream) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        let path = self.key_path(key).await?;
        let written = Self::write_atomic(&path, data).await?;
        tracing::debug!(key = %key, size = written, "Stored object");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        self.lifecycle.ensure_open()?;
        let path = self.key_path(key).await?;
        let file = fs::File::open(&path).await.map_err(Self::not_found(key))?;
        let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)
            .map(|chunk| chunk.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn download_range(&self, key: &str, start: u64, end: u64) -> StorageResult<ByteStream> {
        self.lifecycle.ensure_open()?;
        check_range(start, end)?;
        let path = self.key_path(key).await?;
        let mut file = fs::File::open(&path).await.map_err(Self::not_found(key))?;

        let len = file.metadata().await?.len();
        if start > len {
            return Err(StorageError::InvalidRange(format!(
                "start ({start}) beyond object size ({len})"
            )));
        }
        let end = end.min(len);

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let stream = ReaderStream::with_capacity(file.take(end - start), STREAM_CHUNK_SIZE)
            .map(|chunk| chunk.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        let path = self.key_path(key).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn rename(&self, key: &str, new_name: &str) -> StorageResult<String> {
        self.lifecycle.ensure_open()?;
        let from = self.key_path(key).await?;
        if !fs::try_exists(&from).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let new_key = renamed_key(key, new_name)?;
        let to = self.key_path(&new_key).await?;
        fs::rename(&from, &to).await.map_err(Self::not_found(key))?;
        Ok(new_key)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn get_url(&self, key: &str, expires_in: Option<Duration>) -> StorageResult<String> {
        self.lifecycle.ensure_open()?;
        let path = self.key_path(key).await?;
        if expires_in.is_some() {
            tracing::debug!(key = %key, "Local URLs do not expire; ignoring expiry");
        }
        Ok(match &self.public_url {
            Some(base) => format!("{base}/{}", encode_key(key)),
            None => format!("file://{}", path.display()),
        })
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.lifecycle.ensure_open()?;
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        mime_type: Option<&str>,
    ) -> StorageResult<String> {
        self.lifecycle.ensure_open()?;
        // Validates the destination key up front.
        self.key_path(key).await?;

        let upload_id = Uuid::new_v4().to_string();
        let dir = self.multipart_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;

        let meta = MultipartMeta {
            key: key.to_string(),
            mime_type: mime_type.map(str::to_string),
            initiated: OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_vec(&meta).map_err(|e| {
            StorageError::Io(std::io::Error::other(format!(
                "failed to serialize multipart metadata: {e}"
            )))
        })?;
        fs::write(dir.join(MULTIPART_META_FILE), json).await?;

        tracing::debug!(key = %key, upload_id = %upload_id, "Initiated multipart upload");
        Ok(upload_id)
    }

    #[instrument(skip(self, data), fields(backend = "local"))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        data: Bytes,
    ) -> StorageResult<String> {
        self.lifecycle.ensure_open()?;
        if part_number == 0 {
            return Err(StorageError::InvalidPart("part numbers start at 1".to_string()));
        }
        if size != data.len() as u64 {
            return Err(StorageError::InvalidPart(format!(
                "declared size {size} does not match payload length {}",
                data.len()
            )));
        }
        let dir = self.read_meta(key, upload_id).await?;

        let part_id = ContentHash::compute(&data).to_hex();
        let path = Self::part_path(&dir, part_number);
        Self::write_atomic(&path, crate::traits::bytes_stream(data)).await?;
        Ok(part_id)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list_parts(&self, key: &str, upload_id: &str) -> StorageResult<Vec<PartInfo>> {
        self.lifecycle.ensure_open()?;
        let dir = self.read_meta(key, upload_id).await?;
        Self::stored_parts(&dir).await
    }

    #[instrument(skip(self, parts), fields(backend = "local", parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        check_completed_parts(parts)?;
        let dir = self.read_meta(key, upload_id).await?;

        let stored: HashMap<u32, PartInfo> = Self::stored_parts(&dir)
            .await?
            .into_iter()
            .map(|p| (p.part_number, p))
            .collect();
        for part in parts {
            let info = stored.get(&part.part_number).ok_or_else(|| {
                StorageError::InvalidPart(format!(
                    "missing uploaded part {} for upload {upload_id}",
                    part.part_number
                ))
            })?;
            if info.part_id != part.part_id {
                return Err(StorageError::InvalidPart(format!(
                    "part id mismatch for part {}",
                    part.part_number
                )));
            }
        }

        let path = self.key_path(key).await?;
        Self::ensure_parent(&path).await?;
        let temp_path = Self::temp_path(&path);
        let assembled = async {
            let mut out = fs::File::create(&temp_path).await?;
            let mut total = 0u64;
            for part in parts {
                let mut input = fs::File::open(Self::part_path(&dir, part.part_number)).await?;
                total += tokio::io::copy(&mut input, &mut out).await?;
            }
            out.sync_all().await?;
            Ok::<_, StorageError>(total)
        }
        .await;
        let total = match assembled {
            Ok(total) => total,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };
        fs::rename(&temp_path, &path).await?;

        if let Err(e) = fs::remove_dir_all(&dir).await {
            tracing::warn!(
                upload_id = %upload_id,
                error = %e,
                "Failed to remove multipart staging directory"
            );
        }

        tracing::debug!(key = %key, upload_id = %upload_id, size = total, "Completed multipart upload");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        let dir = self.read_meta(key, upload_id).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if self.lifecycle.close() {
            tracing::debug!(root = %self.root.display(), "Closed local backend");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn health_check(&self) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }
        Ok(())
    }
}

fn validate(config: &StorageConfig) -> Result<(), String> {
    if config.property(ROOT_PROPERTY).is_none() {
        return Err(format!("'{ROOT_PROPERTY}' property is required"));
    }
    validate_public_url(config.property(PUBLIC_URL_PROPERTY))
}

fn create(config: StorageConfig) -> BoxFuture<'static, StorageResult<Arc<dyn StorageBackend>>> {
    Box::pin(async move {
        let root = config
            .property(ROOT_PROPERTY)
            .ok_or_else(|| StorageError::configuration(PLATFORM, "missing root"))?;
        let public_url = config.property(PUBLIC_URL_PROPERTY).map(str::to_string);
        let backend = LocalBackend::new(root, public_url).await?;
        Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
    })
}

pub fn registration() -> PlatformRegistration {
    PlatformRegistration {
        platform: PLATFORM,
        description: "Local filesystem",
        min_part_size: 0,
        validate,
        create,
    }
}
