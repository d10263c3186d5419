//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ListingOptions, ListingPage, ObjectEntry, ObjectMeta, ObjectStore, PageStream, PartReceipt,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::DateTime as AwsDateTime;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::instrument;

/// Maximum range size for get_range operations (128 MiB).
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// S3 allows at most 10,000 parts per upload.
const MAX_PARTS: u32 = 10_000;

/// Marker included in lazy-credentials errors so they map to config errors
/// instead of generic transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "twinstore-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "twinstore-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// Avoids constructor-time TLS/native-root initialization in environments
/// without root certificates.
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

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async {
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
            })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
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

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

fn status_of<E>(err: &aws_sdk_s3::error::SdkError<E>) -> Option<u16> {
    match err {
        aws_sdk_s3::error::SdkError::ServiceError(service_err) => {
            Some(service_err.raw().status().as_u16())
        }
        _ => None,
    }
}

fn to_offset_date_time(dt: &AwsDateTime) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(dt.secs())
        .ok()
        .and_then(|t| t.replace_nanosecond(dt.subsec_nanos()).ok())
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects `endpoint/bucket/key` URLs, which MinIO and
    /// some S3-compatible services require.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "twinstore-config");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region));
        }

        if let Some(endpoint_url) = endpoint.as_deref().map(normalize_endpoint) {
            // Plain-HTTP endpoints (local MinIO) get an HTTP-only client so SDK
            // initialization does not need native trust roots.
            if endpoint_url.starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(&format!("{prefix}/"))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }

    /// Convert an AWS SDK error, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if status_of(&err) == Some(404) {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }

    /// Convert a multipart SDK error, mapping NoSuchUpload (404) to UnknownSession.
    fn map_session_error<E>(
        err: aws_sdk_s3::error::SdkError<E>,
        key: &str,
        session: &str,
    ) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if status_of(&err) == Some(404) {
            return StorageError::UnknownSession {
                key: key.to_string(),
                session: session.to_string(),
            };
        }
        map_s3_operation_error(err)
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// S3 part numbers are 1-based.
fn part_number(part_index: u32) -> StorageResult<i32> {
    if part_index >= MAX_PARTS {
        return Err(StorageError::InvalidRange(format!(
            "part index {part_index} exceeds the S3 limit of {MAX_PARTS} parts"
        )));
    }
    Ok(part_index as i32 + 1)
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if status_of(&err) == Some(404) => Ok(false),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified: output.last_modified().and_then(to_offset_date_time),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();
        Ok(bytes)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        if end == start {
            return Ok(Bytes::new());
        }
        let range_size = end - start;
        if range_size > MAX_RANGE_SIZE {
            return Err(StorageError::InvalidRange(format!(
                "range size {range_size} exceeds maximum {MAX_RANGE_SIZE} bytes"
            )));
        }

        // Range header end is inclusive.
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .range(format!("bytes={}-{}", start, end - 1))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        if bytes.len() as u64 != range_size {
            return Err(StorageError::InvalidRange(format!(
                "requested {range_size} bytes of {key} from {start}, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put_part(
        &self,
        key: &str,
        session: &str,
        part_index: u32,
        data: Bytes,
    ) -> StorageResult<PartReceipt> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(session)
            .part_number(part_number(part_index)?)
            .body(data.into())
            .send()
            .await
            .map_err(|e| Self::map_session_error(e, key, session))?;

        Ok(PartReceipt {
            part_index,
            etag: output.e_tag().map(str::to_string),
        })
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn compose_parts(
        &self,
        key: &str,
        session: &str,
        parts: &[PartReceipt],
    ) -> StorageResult<()> {
        if parts.is_empty() {
            return Err(StorageError::MissingPart(format!(
                "{key}: cannot compose an empty part list"
            )));
        }

        let mut sorted: Vec<&PartReceipt> = parts.iter().collect();
        sorted.sort_by_key(|p| p.part_index);
        sorted.dedup_by_key(|p| p.part_index);

        let mut completed = Vec::with_capacity(sorted.len());
        for part in sorted {
            let etag = part.etag.clone().ok_or_else(|| {
                StorageError::MissingPart(format!("{key}: part {} has no etag", part.part_index))
            })?;
            completed.push(
                CompletedPart::builder()
                    .e_tag(etag)
                    .part_number(part_number(part.part_index)?)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(session)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Self::map_session_error(e, key, session))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart(&self, key: &str, session: &str) -> StorageResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(session)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if status_of(&err) == Some(404) => Ok(()),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // delete_object succeeds on missing keys, so check first to report NotFound.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a> {
        let full_prefix = self.full_key(prefix);
        let page_size = options.normalized_page_size();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&full_prefix)
                    .max_keys(page_size as i32);

                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let output = request.send().await.map_err(map_s3_operation_error)?;

                let entries: Vec<ObjectEntry> = output
                    .contents()
                    .iter()
                    .filter_map(|obj| {
                        obj.key().map(|k| ObjectEntry {
                            key: self.strip_prefix(k),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                            last_modified: obj.last_modified().and_then(to_offset_date_time),
                        })
                    })
                    .collect();

                if !entries.is_empty() {
                    yield ListingPage { entries };
                }

                if output.is_truncated() != Some(true) {
                    break;
                }
                continuation_token = output.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            }
        };

        Box::pin(stream)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let marker_key = self.full_key(".twinstore-health-check");
        let check = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(err) if status_of(&err) == Some(404) => Ok(()),
                Err(err) => Err(map_s3_operation_error(err)),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_backend(prefix: Option<String>) -> S3Backend {
        S3Backend::new(
            "test-bucket",
            Some("s3.test".to_string()),
            Some("us-east-1".to_string()),
            prefix,
            Some("access".to_string()),
            Some("secret".to_string()),
            true,
        )
        .await
        .expect("backend should construct for unit tests")
    }

    #[tokio::test]
    async fn test_full_key_and_strip_prefix() {
        let backend = make_backend(Some("prefix/".to_string())).await;
        assert_eq!(backend.full_key("blobs/abc"), "prefix/blobs/abc");
        assert_eq!(backend.strip_prefix("prefix/blobs/abc"), "blobs/abc");
        assert_eq!(backend.strip_prefix("other/path"), "other/path");

        let backend = make_backend(None).await;
        assert_eq!(backend.full_key("blobs/abc"), "blobs/abc");
    }

    #[test]
    fn test_part_numbers_are_one_based_and_bounded() {
        assert_eq!(part_number(0).unwrap(), 1);
        assert_eq!(part_number(9_999).unwrap(), 10_000);
        assert!(matches!(
            part_number(10_000),
            Err(StorageError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("minio:9000"), "http://minio:9000");
        assert_eq!(
            normalize_endpoint("https://s3.amazonaws.com"),
            "https://s3.amazonaws.com"
        );
    }

    #[tokio::test]
    async fn test_s3_new_requires_complete_credentials() {
        let err = S3Backend::new(
            "bucket",
            None,
            Some("us-east-1".to_string()),
            None,
            Some("access".to_string()),
            None,
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_compose_rejects_empty_and_untagged_parts() {
        let backend = make_backend(None).await;
        assert!(matches!(
            backend.compose_parts("blobs/x", "upload", &[]).await,
            Err(StorageError::MissingPart(_))
        ));
        let untagged = PartReceipt {
            part_index: 0,
            etag: None,
        };
        assert!(matches!(
            backend.compose_parts("blobs/x", "upload", &[untagged]).await,
            Err(StorageError::MissingPart(_))
        ));
    }
}
