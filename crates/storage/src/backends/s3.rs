//! S3-compatible storage backend using AWS SDK.

use super::{Lifecycle, encode_key, validate_public_url};
use crate::error::{StorageError, StorageResult};
use crate::registry::PlatformRegistration;
use crate::traits::{
    ByteStream, CompletedPart, PartInfo, StorageBackend, check_completed_parts, check_range,
    collect_stream, renamed_key,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use depot_core::StorageConfig;
use futures::StreamExt;
use futures::future::BoxFuture;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Platform identifier.
pub const PLATFORM: &str = "s3";

/// S3 rejects completion when any part but the last is smaller.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Longest expiry S3 accepts for a presigned URL.
const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Markers included in lazy-credentials errors so they map to configuration
/// errors instead of generic provider failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "depot-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "depot-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// Keeps backend construction free of side effects such as TLS root loading,
/// which matters because instances are built on the request path.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

/// Translate an SDK error into a [`StorageError`].
fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = DisplayErrorContext(&err).to_string();
    if detail.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || detail.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::configuration(
            PLATFORM,
            "credential initialization failed; configure access keys explicitly or provide ambient AWS credentials",
        );
    }

    match &err {
        SdkError::TimeoutError(_) => return StorageError::Timeout(key.to_string()),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            return StorageError::Timeout(key.to_string());
        }
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            let code = service_err.err().code();
            if status == 404 || matches!(code, Some("NoSuchKey" | "NoSuchUpload" | "NotFound")) {
                return StorageError::NotFound(key.to_string());
            }
            if status == 403 || code == Some("AccessDenied") {
                return StorageError::PermissionDenied(key.to_string());
            }
        }
        _ => {}
    }

    StorageError::Provider(detail)
}

/// Connection settings parsed from a [`StorageConfig`]'s properties.
#[derive(Clone, Debug, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Use `endpoint/bucket/key` URLs instead of `bucket.endpoint/key`.
    /// Required for MinIO and some S3-compatible services.
    pub force_path_style: bool,
    pub public_url: Option<String>,
}

impl S3Settings {
    pub fn from_config(config: &StorageConfig) -> Result<Self, String> {
        let owned = |name: &str| config.property(name).map(str::to_string);
        let bucket = owned("bucket").ok_or_else(|| "'bucket' property is required".to_string())?;
        let force_path_style = match config.property("force_path_style") {
            None => false,
            Some(raw) => raw
                .parse::<bool>()
                .map_err(|_| format!("force_path_style must be true or false, got '{raw}'"))?,
        };
        let settings = Self {
            bucket,
            endpoint: owned("endpoint"),
            region: owned("region"),
            prefix: owned("prefix"),
            access_key_id: owned("access_key_id"),
            secret_access_key: owned("secret_access_key"),
            force_path_style,
            public_url: owned("public_url"),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            );
        }
        validate_public_url(self.public_url.as_deref())
    }
}

/// S3-compatible object storage backend.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Normalized endpoint URL, when not talking to AWS proper.
    endpoint: Option<String>,
    region: String,
    force_path_style: bool,
    public_url: Option<String>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend. Makes no network calls.
    pub async fn new(settings: S3Settings) -> StorageResult<Self> {
        settings
            .validate()
            .map_err(|message| StorageError::configuration(PLATFORM, message))?;

        let resolved_region = settings.region.unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (settings.access_key_id, settings.secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "depot-config");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region.clone()));
        }

        // Bare host:port endpoints (e.g. "minio:9000") get an http:// scheme.
        let normalized_endpoint = settings.endpoint.as_ref().map(|endpoint_url| {
            let lower = endpoint_url.to_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url.trim_end_matches('/').to_string()
            } else {
                format!("http://{}", endpoint_url.trim_end_matches('/'))
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // Plain-HTTP endpoints get an HTTP-only client so construction
            // does not depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if settings.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        // Strip trailing slashes to avoid "prefix//key".
        let prefix = settings
            .prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client,
            bucket: settings.bucket,
            prefix,
            endpoint: normalized_endpoint,
            region: resolved_region,
            force_path_style: settings.force_path_style,
            public_url: settings.public_url.map(|u| u.trim_end_matches('/').to_string()),
            lifecycle: Lifecycle::new(PLATFORM),
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Non-expiring URL of an object.
    fn object_url(&self, key: &str) -> String {
        let path = encode_key(&self.full_key(key));
        if let Some(base) = &self.public_url {
            return format!("{base}/{path}");
        }
        match &self.endpoint {
            Some(endpoint) if self.force_path_style => {
                format!("{endpoint}/{}/{path}", self.bucket)
            }
            Some(endpoint) => match endpoint.split_once("://") {
                Some((scheme, host)) => format!("{scheme}://{}.{host}/{path}", self.bucket),
                None => format!("{endpoint}/{}/{path}", self.bucket),
            },
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{path}",
                self.bucket, self.region
            ),
        }
    }

    fn part_number(part_number: u32) -> StorageResult<i32> {
        match i32::try_from(part_number) {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(StorageError::InvalidPart(format!(
                "part number out of range: {part_number}"
            ))),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn platform(&self) -> &str {
        PLATFORM
    }

    #[instrument(skip(self, data), fields(backend = "s3"))]
    async fn upload(&self, key: &str, data: ByteStream) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        let body = collect_stream(data).await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(body.into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        self.lifecycle.ensure_open()?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|result| result.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn download_range(&self, key: &str, start: u64, end: u64) -> StorageResult<ByteStream> {
        self.lifecycle.ensure_open()?;
        if check_range(start, end)? == 0 {
            return Ok(Box::pin(futures::stream::empty()));
        }

        // S3 Range header uses an inclusive end.
        let range_header = format!("bytes={}-{}", start, end - 1);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .range(range_header)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|result| result.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match map_sdk_error(e, key) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn rename(&self, key: &str, new_name: &str) -> StorageResult<String> {
        self.lifecycle.ensure_open()?;
        let new_key = renamed_key(key, new_name)?;
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        // CopySource is "bucket/key" with the key URL-encoded.
        let from_full = self.full_key(key);
        let encoded_key = utf8_percent_encode(&from_full, NON_ALPHANUMERIC).to_string();
        let copy_source = format!("{}/{}", self.bucket, encoded_key);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(self.full_key(&new_key))
            .copy_source(&copy_source)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        self.delete(key).await?;
        Ok(new_key)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_url(&self, key: &str, expires_in: Option<Duration>) -> StorageResult<String> {
        self.lifecycle.ensure_open()?;
        let Some(expires_in) = expires_in else {
            return Ok(self.object_url(key));
        };

        let presign = PresigningConfig::expires_in(expires_in.min(MAX_PRESIGN_EXPIRY))
            .map_err(|e| StorageError::Provider(format!("invalid presign expiry: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .presigned(presign)
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(request.uri().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.lifecycle.ensure_open()?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => match map_sdk_error(err, key) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        mime_type: Option<&str>,
    ) -> StorageResult<String> {
        self.lifecycle.ensure_open()?;
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_content_type(mime_type.map(str::to_string))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Provider("S3 did not return an upload id".to_string()))
    }

    #[instrument(skip(self, data), fields(backend = "s3"))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        data: Bytes,
    ) -> StorageResult<String> {
        self.lifecycle.ensure_open()?;
        let number = Self::part_number(part_number)?;
        if size != data.len() as u64 {
            return Err(StorageError::InvalidPart(format!(
                "declared size {size} does not match payload length {}",
                data.len()
            )));
        }
        let content_length = i64::try_from(size)
            .map_err(|_| StorageError::InvalidPart(format!("part too large: {size}")))?;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .part_number(number)
            .content_length(content_length)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Provider("S3 did not return a part ETag".to_string()))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_parts(&self, key: &str, upload_id: &str) -> StorageResult<Vec<PartInfo>> {
        self.lifecycle.ensure_open()?;
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(self.full_key(key))
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, key))?;

            for part in output.parts() {
                let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) else {
                    continue;
                };
                parts.push(PartInfo {
                    part_number: u32::try_from(number).unwrap_or_default(),
                    part_id: etag.to_string(),
                    size: part.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                });
            }

            match (output.is_truncated(), output.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        check_completed_parts(parts)?;

        let completed = parts
            .iter()
            .map(|part| {
                Ok(aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(Self::part_number(part.part_number)?)
                    .e_tag(&part.part_id)
                    .build())
            })
            .collect::<StorageResult<Vec<_>>>()?;
        let upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if self.lifecycle.close() {
            tracing::debug!(bucket = %self.bucket, "Closed S3 backend");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        self.lifecycle.ensure_open()?;
        let marker_key = self.full_key(".depot-health-check");

        let round_trip = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &marker_key))?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => match map_sdk_error(e, &marker_key) {
                    StorageError::NotFound(_) => Ok(()),
                    other => Err(other),
                },
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, round_trip)
            .await
            .map_err(|_| {
                StorageError::Timeout(format!(
                    "S3 health check timed out after {} seconds",
                    HEALTH_CHECK_TIMEOUT.as_secs()
                ))
            })?
    }
}

fn validate(config: &StorageConfig) -> Result<(), String> {
    S3Settings::from_config(config).map(|_| ())
}

fn create(config: StorageConfig) -> BoxFuture<'static, StorageResult<Arc<dyn StorageBackend>>> {
    Box::pin(async move {
        let settings = S3Settings::from_config(&config)
            .map_err(|message| StorageError::configuration(PLATFORM, message))?;
        let backend = S3Backend::new(settings).await?;
        Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
    })
}

pub fn registration() -> PlatformRegistration {
    PlatformRegistration {
        platform: PLATFORM,
        description: "S3-compatible object storage",
        min_part_size: MIN_PART_SIZE,
        validate,
        create,
    }
}
