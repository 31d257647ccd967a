//! S3-compatible storage backend.
//!
//! This module provides a storage backend implementation for S3-compatible
//! services including AWS S3, MinIO, Backblaze B2, Tigris (Fly.io), and others.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via configuration. Each disk specifies
//! its own `access_key` and `secret_key` (plus an optional `session_token`
//! for temporary credentials).
//!
//! # Directories
//!
//! Object storage has no directories. Listings synthesize one entry for every
//! distinct key prefix below the requested one, so the result looks the same
//! as a filesystem listing of the same content. Keys ending in `/` (folder
//! markers created by some consoles) are reported as directories too.
//!
//! # Metadata
//!
//! Metadata is stored natively: the content type becomes the object's
//! `Content-Type` and custom headers become user-defined object metadata
//! (`x-amz-meta-*`). Replacing metadata is a server-side copy of the object
//! onto itself.
//!
//! Written metadata also carries a `depot-metadata` user metadata entry, so
//! an object without recorded metadata reads back as `None` no matter which
//! content type the service assigned to it. The key is reserved: a custom
//! header of the same name is overwritten.

use crate::backend::{BoxAsyncRead, FileInfoStream, S3Config};
use crate::error::{ErrorKind, Operation, Result};
use crate::models::{FileInfo, Metadata};
use crate::path::{ancestors_below, checked, checked_prefix, validate as validate_path, validate_prefix};
use crate::StorageBackend;
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    operation::{
        complete_multipart_upload::CompleteMultipartUploadError, copy_object::CopyObjectError,
        create_multipart_upload::CreateMultipartUploadError, delete_object::DeleteObjectError,
        get_object::{GetObjectError, GetObjectOutput}, head_object::{HeadObjectError, HeadObjectOutput},
        list_objects_v2::ListObjectsV2Error, put_object::PutObjectError, upload_part::UploadPartError,
    },
    primitives::{ByteStream, DateTime},
    types::{CompletedMultipartUpload, CompletedPart, MetadataDirective},
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
///
/// TODO: Adaptive rate limiting based on 429/throttling responses?
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
/// Streams larger than this are uploaded in parts of this size. Must stay at
/// or above the 5 MiB minimum part size S3 enforces.
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;
/// User metadata key recording that metadata was written through this
/// backend. Its value says whether the content type is the caller's, since
/// services fill in their own when none was given.
const METADATA_MARKER: &str = "depot-metadata";
const MARKER_TYPED: &str = "typed";
const MARKER_UNTYPED: &str = "untyped";

/// S3-compatible storage backend.
///
/// Stores files in an S3 bucket, optionally under a key prefix. All paths are
/// relative to the configured prefix (if any).
///
/// # Supported Services
///
/// - AWS S3
/// - MinIO
/// - Backblaze B2 (via S3-compatible API)
/// - Tigris (Fly.io storage)
/// - Other S3-compatible services
///
/// # Examples
///
/// ```no_run
/// use depot_storage::backend::{S3Backend, S3Config};
///
/// # fn example() -> depot_storage::error::Result<()> {
/// let mut config = S3Config::new("my-bucket");
/// config.endpoint = Some("http://localhost:9000".to_string());
/// config.access_key = Some("minioadmin".to_string());
/// config.secret_key = Some("minioadmin".to_string());
/// config.prefix = Some("tenant-42".to_string());
/// config.path_style = true;
/// let backend = S3Backend::new("s3", config)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    /// Normalized key prefix; empty when keys live at the bucket root.
    prefix: String,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// No request is made; a bad endpoint or credentials surface on first use.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidConfig`](ErrorKind::InvalidConfig) if the bucket is
    /// empty, the prefix fails path validation, or only one half of the
    /// access key pair is supplied.
    pub fn new(name: impl Into<String>, config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            exn::bail!(ErrorKind::InvalidConfig("bucket name is required".to_string()));
        }
        let credentials = match (config.access_key, config.secret_key) {
            (Some(key_id), Some(key_secret)) => {
                Credentials::new(key_id, key_secret, config.session_token, None, "depot-config")
            },
            // Anonymous access: requests are signed with empty credentials.
            (None, None) => Credentials::new("", "", None, None, "depot-config"),
            _ => exn::bail!(ErrorKind::InvalidConfig(
                "access_key and secret_key must be provided together".to_string()
            )),
        };
        let region = match config.region {
            region if region.is_empty() => S3Config::DEFAULT_REGION.to_string(),
            region => region,
        };
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region))
            // Retries are left to the caller (see `ErrorKind::is_retryable()`).
            .retry_config(RetryConfig::disabled())
            .force_path_style(config.path_style);
        // Set custom endpoint for non-AWS services
        if let Some(endpoint_url) = config.endpoint.filter(|e| !e.is_empty()) {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let client = Client::from_conf(config_builder.build());
        Self::from_client(name, client, config.bucket, config.prefix.as_deref().unwrap_or_default())
    }

    /// Create a backend around an already configured client.
    pub fn from_client(name: impl Into<String>, client: Client, bucket: impl Into<String>, prefix: &str) -> Result<Self> {
        let prefix = validate_prefix(prefix)
            .map_err(|reason| ErrorKind::InvalidConfig(format!("invalid key prefix {prefix:?}: {reason}")))?;
        Ok(Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Validate a caller path and construct the full S3 key for it.
    fn key(&self, op: Operation, path: &str) -> Result<String> {
        Ok(join_key(&self.prefix, &checked(op, path)?))
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self, op: Operation, path: &str) -> Result<OwnedSemaphorePermit> {
        let permit = self
            .rate_limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ErrorKind::network(op, path, "request limiter closed"))?;
        Ok(permit)
    }

    async fn put_object(
        &self,
        op: Operation,
        path: &str,
        key: &str,
        data: Vec<u8>,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        let _permit = self.acquire_permit(op, path).await?;
        let (content_type, user_metadata) = native_metadata(metadata);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_content_type(content_type)
            .set_metadata(user_metadata)
            .send()
            .await
            .map_err(|e| request_error(op, path, e))?;
        Ok(())
    }

    /// `Ok(None)` when the object does not exist.
    async fn head_object(&self, op: Operation, path: &str, key: &str) -> Result<Option<HeadObjectOutput>> {
        let _permit = self.acquire_permit(op, path).await?;
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => Ok(Some(output)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => exn::bail!(request_error(op, path, e)),
        }
    }

    async fn get_object(&self, op: Operation, path: &str) -> Result<GetObjectOutput> {
        let key = self.key(op, path)?;
        let _permit = self.acquire_permit(op, path).await?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| request_error(op, path, e))?;
        Ok(output)
    }

    async fn upload_multipart(
        &self,
        op: Operation,
        path: &str,
        key: &str,
        first: Vec<u8>,
        reader: &mut BoxAsyncRead,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        let (content_type, user_metadata) = native_metadata(metadata);
        let created = {
            let _permit = self.acquire_permit(op, path).await?;
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .set_content_type(content_type)
                .set_metadata(user_metadata)
                .send()
                .await
                .map_err(|e| request_error(op, path, e))?
        };
        let Some(upload_id) = created.upload_id() else {
            exn::bail!(ErrorKind::network(op, path, "multipart upload created without an upload id"));
        };
        tracing::debug!(disk = %self.name, key, upload_id, "Started multipart upload");

        let result = self.upload_parts(op, path, key, upload_id, first, reader).await;
        if result.is_err() {
            self.abort_multipart(key, upload_id).await;
        }
        result
    }

    async fn upload_parts(
        &self,
        op: Operation,
        path: &str,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        reader: &mut BoxAsyncRead,
    ) -> Result<()> {
        let mut parts = Vec::new();
        let mut chunk = first;
        while !chunk.is_empty() {
            let part_number = i32::try_from(parts.len() + 1)
                .map_err(|_| ErrorKind::network(op, path, "too many parts for a multipart upload"))?;
            let last = chunk.len() < MULTIPART_PART_SIZE;
            let uploaded = {
                let _permit = self.acquire_permit(op, path).await?;
                self.client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(|e| request_error(op, path, e))?
            };
            tracing::trace!(disk = %self.name, key, part_number, "Uploaded part");
            parts.push(CompletedPart::builder().set_e_tag(uploaded.e_tag().map(str::to_string)).part_number(part_number).build());
            chunk = if last {
                Vec::new()
            } else {
                read_chunk(reader).await.map_err(|e| ErrorKind::io(op, path, e))?
            };
        }

        let _permit = self.acquire_permit(op, path).await?;
        let parts_count = parts.len();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| request_error(op, path, e))?;
        tracing::debug!(disk = %self.name, key, parts = parts_count, "Completed multipart upload");
        Ok(())
    }

    /// Best-effort; an upload left behind only costs storage until the
    /// bucket's lifecycle rules clean it up.
    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let aborted = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = aborted {
            tracing::warn!(disk = %self.name, key, upload_id, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
        }
    }

    /// Server-side copy. `metadata` of `None` carries the source's metadata
    /// over; `Some` replaces it.
    async fn copy_object(
        &self,
        op: Operation,
        path: &str,
        source_key: &str,
        target_key: &str,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        let _permit = self.acquire_permit(op, path).await?;
        let request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source(&self.bucket, source_key))
            .key(target_key);
        let request = match metadata {
            Some(metadata) => {
                let (content_type, user_metadata) = native_metadata(Some(metadata));
                request
                    .metadata_directive(MetadataDirective::Replace)
                    .set_content_type(content_type)
                    .set_metadata(user_metadata)
            },
            None => request.metadata_directive(MetadataDirective::Copy),
        };
        request.send().await.map_err(|e| request_error(op, path, e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let key = self.key(Operation::Put, path)?;
        self.put_object(Operation::Put, path, &key, data.to_vec(), None).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let output = self.get_object(Operation::Get, path).await?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| ErrorKind::network(Operation::Get, path, e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.key(Operation::Delete, path)?;
        // DeleteObject succeeds for missing keys; check first so a missing
        // file is reported the same way as on every other backend.
        if self.head_object(Operation::Delete, path, &key).await?.is_none() {
            exn::bail!(ErrorKind::not_found(Operation::Delete, path));
        }
        let _permit = self.acquire_permit(Operation::Delete, path).await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| request_error(Operation::Delete, path, e))?;
        Ok(())
    }

    async fn put_stream(&self, path: &str, mut reader: BoxAsyncRead, metadata: Option<&Metadata>) -> Result<()> {
        let op = Operation::PutStream;
        let key = self.key(op, path)?;
        let first = read_chunk(&mut reader).await.map_err(|e| ErrorKind::io(op, path, e))?;
        if first.len() < MULTIPART_PART_SIZE {
            return self.put_object(op, path, &key, first, metadata).await;
        }
        self.upload_multipart(op, path, &key, first, &mut reader, metadata).await
    }

    async fn get_stream(&self, path: &str) -> Result<BoxAsyncRead> {
        let output = self.get_object(Operation::GetStream, path).await?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.key(Operation::Exists, path)?;
        Ok(self.head_object(Operation::Exists, path, &key).await?.is_some())
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let key = self.key(Operation::Size, path)?;
        let head = self.head_object(Operation::Size, path, &key).await?;
        let head = head.ok_or_else(|| ErrorKind::not_found(Operation::Size, path))?;
        Ok(head.content_length().and_then(|len| u64::try_from(len).ok()).unwrap_or_default())
    }

    fn list_stream<'a>(&'a self, prefix: &'a str) -> FileInfoStream<'a> {
        let validated_prefix = match checked_prefix(Operation::List, prefix) {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        // Trailing slash keeps `dir1` from matching `dir10/...`.
        let key_prefix = match join_key(&self.prefix, &validated_prefix) {
            pfx if pfx.is_empty() => pfx,
            pfx => format!("{pfx}/"),
        };

        Box::pin(stream! {
            let mut seen_dirs: HashSet<String> = HashSet::new();
            let mut continuation_token: Option<String> = None;
            let mut page = 0usize;
            loop {
                let permit = match self.acquire_permit(Operation::List, prefix).await {
                    Ok(permit) => permit,
                    Err(e) => { yield Err(e); break; },
                };
                let response = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&key_prefix)
                    .set_continuation_token(continuation_token.take())
                    .send()
                    .await;
                drop(permit);
                let response = match response {
                    Ok(response) => response,
                    Err(e) => { yield Err(exn::Exn::from(request_error(Operation::List, prefix, e))); break; },
                };
                page += 1;
                tracing::trace!(disk = %self.name, prefix = %key_prefix, page, objects = response.contents().len(), "Listed page");

                for object in response.contents() {
                    let Some(key) = object.key() else { continue };
                    let Some(relative) = strip_key_prefix(&self.prefix, key) else { continue };
                    let Ok(path) = validate_path(relative) else {
                        tracing::debug!(disk = %self.name, key, "Skipping object with an unaddressable key");
                        continue;
                    };
                    let modified = object.last_modified().and_then(to_offset_datetime).unwrap_or(OffsetDateTime::UNIX_EPOCH);
                    for dir in ancestors_below(&validated_prefix, &path) {
                        if seen_dirs.insert(dir.to_string()) {
                            yield Ok(FileInfo::directory(dir, modified));
                        }
                    }
                    if path == validated_prefix {
                        continue;
                    }
                    if key.ends_with('/') {
                        if seen_dirs.insert(path.clone()) {
                            yield Ok(FileInfo::directory(path, modified));
                        }
                        continue;
                    }
                    let size = object.size().and_then(|size| u64::try_from(size).ok()).unwrap_or_default();
                    yield Ok(FileInfo::file(path, size, modified));
                }

                match (response.is_truncated(), response.next_continuation_token()) {
                    (Some(true), Some(token)) => continuation_token = Some(token.to_string()),
                    _ => break,
                }
            }
        })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source_key = self.key(Operation::Copy, from)?;
        let target_key = self.key(Operation::Copy, to)?;
        if source_key == target_key {
            // S3 refuses to copy an object onto itself without changing it.
            return match self.head_object(Operation::Copy, from, &source_key).await? {
                Some(_) => Ok(()),
                None => exn::bail!(ErrorKind::not_found(Operation::Copy, from)),
            };
        }
        self.copy_object(Operation::Copy, from, &source_key, &target_key, None).await
    }

    async fn put_with_metadata(&self, path: &str, data: &[u8], metadata: &Metadata) -> Result<()> {
        let key = self.key(Operation::PutWithMetadata, path)?;
        self.put_object(Operation::PutWithMetadata, path, &key, data.to_vec(), Some(metadata)).await
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<Metadata>> {
        let op = Operation::GetMetadata;
        let key = self.key(op, path)?;
        let head = self.head_object(op, path, &key).await?.ok_or_else(|| ErrorKind::not_found(op, path))?;
        let mut custom_headers = head.metadata().cloned().unwrap_or_default();
        let content_type = match custom_headers.remove(METADATA_MARKER).as_deref() {
            None => return Ok(None),
            Some(MARKER_UNTYPED) => "",
            Some(_) => head.content_type().unwrap_or_default(),
        };
        Ok(Some(Metadata {
            content_type: content_type.to_string(),
            size: head.content_length().and_then(|len| u64::try_from(len).ok()).unwrap_or_default(),
            last_modified: head.last_modified().and_then(to_offset_datetime),
            custom_headers,
        }))
    }

    async fn set_metadata(&self, path: &str, metadata: &Metadata) -> Result<()> {
        let key = self.key(Operation::SetMetadata, path)?;
        self.copy_object(Operation::SetMetadata, path, &key, &key, Some(metadata)).await
    }
}

/// Join the configured key prefix and a normalized path.
fn join_key(prefix: &str, path: &str) -> String {
    match (prefix.is_empty(), path.is_empty()) {
        (true, _) => path.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{path}"),
    }
}

/// Strip the configured key prefix from an object key. Returns `None` for
/// keys that don't live under the prefix.
fn strip_key_prefix<'k>(prefix: &str, key: &'k str) -> Option<&'k str> {
    if prefix.is_empty() {
        return Some(key);
    }
    key.strip_prefix(prefix)?.strip_prefix('/')
}

/// `CopySource` is `bucket/key`, URL-encoded.
fn copy_source(bucket: &str, key: &str) -> String {
    let mut encoded = String::with_capacity(bucket.len() + key.len() + 1);
    for byte in bucket.bytes().chain(std::iter::once(b'/')).chain(key.bytes()) {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Split metadata into the native `Content-Type` and user metadata fields.
/// Recorded metadata always yields a user metadata map, since it carries the
/// [`METADATA_MARKER`].
fn native_metadata(metadata: Option<&Metadata>) -> (Option<String>, Option<HashMap<String, String>>) {
    let Some(metadata) = metadata else {
        return (None, None);
    };
    let content_type = Some(metadata.content_type.clone()).filter(|ct| !ct.is_empty());
    let marker = match content_type {
        Some(_) => MARKER_TYPED,
        None => MARKER_UNTYPED,
    };
    let mut user_metadata = metadata.custom_headers.clone();
    user_metadata.insert(METADATA_MARKER.to_string(), marker.to_string());
    (content_type, Some(user_metadata))
}

/// Read up to one part's worth of bytes. A short read means the stream ended.
async fn read_chunk(reader: &mut BoxAsyncRead) -> std::io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(MULTIPART_PART_SIZE);
    AsyncReadExt::take(reader, MULTIPART_PART_SIZE as u64).read_to_end(&mut chunk).await?;
    Ok(chunk)
}

/// Convert AWS DateTime to OffsetDateTime.
fn to_offset_datetime(dt: &DateTime) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos()).ok()
}

/// Operation errors that may carry a modeled "no such key" variant.
trait MissingKey {
    fn is_missing_key(&self) -> bool {
        false
    }
}
impl MissingKey for GetObjectError {
    fn is_missing_key(&self) -> bool {
        self.is_no_such_key()
    }
}
impl MissingKey for HeadObjectError {
    fn is_missing_key(&self) -> bool {
        self.is_not_found()
    }
}
impl MissingKey for PutObjectError {}
impl MissingKey for DeleteObjectError {}
impl MissingKey for CopyObjectError {}
impl MissingKey for ListObjectsV2Error {}
impl MissingKey for CreateMultipartUploadError {}
impl MissingKey for UploadPartError {}
impl MissingKey for CompleteMultipartUploadError {}

/// Whether a request failed because the key doesn't exist. Services disagree
/// on how to say so: modeled errors, bare error codes, or just a 404 with no
/// body (HEAD requests). A 404 with any other code (`NoSuchBucket`) is not
/// about the key.
fn is_missing<E: MissingKey + ProvideErrorMetadata>(err: &SdkError<E, HttpResponse>) -> bool {
    let Some(service_error) = err.as_service_error() else {
        return false;
    };
    if service_error.is_missing_key() {
        return true;
    }
    match service_error.code() {
        Some(code) => matches!(code, "NoSuchKey" | "NotFound"),
        None => err.raw_response().is_some_and(|response| response.status().as_u16() == 404),
    }
}

fn request_error<E>(op: Operation, path: &str, err: SdkError<E, HttpResponse>) -> ErrorKind
where
    E: MissingKey + ProvideErrorMetadata + std::error::Error + 'static,
{
    if is_missing(&err) {
        return ErrorKind::not_found(op, path);
    }
    ErrorKind::network(op, path, DisplayErrorContext(&err).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::{
        delete_object::DeleteObjectOutput, list_objects_v2::ListObjectsV2Output, put_object::PutObjectOutput,
    };
    use aws_sdk_s3::primitives::SdkBody;
    use aws_sdk_s3::types::{Object, error::NoSuchKey, error::NotFound};
    use aws_smithy_mocks::{RuleMode, mock, mock_client};
    use rstest::rstest;

    fn backend(client: Client, prefix: &str) -> S3Backend {
        S3Backend::from_client("s3", client, "bucket", prefix).unwrap()
    }

    #[rstest]
    #[case("", "invoices/2024/march.pdf", "invoices/2024/march.pdf")]
    #[case("tenant", "invoices/2024/march.pdf", "tenant/invoices/2024/march.pdf")]
    #[case("tenant", "", "tenant")]
    #[case("", "", "")]
    fn test_join_key(#[case] prefix: &str, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(join_key(prefix, path), expected);
    }

    #[rstest]
    #[case("", "invoices/2024/march.pdf", Some("invoices/2024/march.pdf"))]
    #[case("tenant", "tenant/invoices/2024/march.pdf", Some("invoices/2024/march.pdf"))]
    #[case("tenant", "tenant2/invoices/2024/march.pdf", None)]
    #[case("tenant", "other/march.pdf", None)]
    fn test_strip_key_prefix(#[case] prefix: &str, #[case] key: &str, #[case] expected: Option<&str>) {
        assert_eq!(strip_key_prefix(prefix, key), expected);
    }

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(copy_source("bucket", "a/b c+d.txt"), "bucket/a/b%20c%2Bd.txt");
        assert_eq!(copy_source("bucket", "plain/key.txt"), "bucket/plain/key.txt");
    }

    #[test]
    fn test_native_metadata_marks_recorded_metadata() {
        assert_eq!(native_metadata(None), (None, None));

        let (content_type, headers) = native_metadata(Some(&Metadata::default()));
        assert_eq!(content_type, None);
        assert_eq!(headers, Some(HashMap::from([(METADATA_MARKER.to_string(), MARKER_UNTYPED.to_string())])));

        let (content_type, headers) = native_metadata(Some(&Metadata::new("text/plain").with_header("k", "v")));
        let headers = headers.unwrap();
        assert_eq!(content_type.as_deref(), Some("text/plain"));
        assert_eq!(headers.get("k").map(String::as_str), Some("v"));
        assert_eq!(headers.get(METADATA_MARKER).map(String::as_str), Some(MARKER_TYPED));
    }

    #[test]
    fn test_new_validates_config() {
        let err = S3Backend::new("s3", S3Config::new("")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidConfig(_)));
        let mut config = S3Config::new("bucket");
        config.access_key = Some("key".to_string());
        let err = S3Backend::new("s3", config).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidConfig(_)));
        let mut config = S3Config::new("bucket");
        config.prefix = Some("../escape".to_string());
        let err = S3Backend::new("s3", config).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_get_uses_prefixed_key() {
        let get = mock!(aws_sdk_s3::Client::get_object)
            .match_requests(|req| req.bucket() == Some("bucket") && req.key() == Some("tenant/docs/a.txt"))
            .then_output(|| GetObjectOutput::builder().body(ByteStream::from_static(b"hello")).build());
        let backend = backend(mock_client!(aws_sdk_s3, [&get]), "tenant");
        assert_eq!(backend.get("/docs/./a.txt").await.unwrap(), b"hello");
        assert_eq!(get.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_file_not_found() {
        let get = mock!(aws_sdk_s3::Client::get_object)
            .then_error(|| GetObjectError::NoSuchKey(NoSuchKey::builder().build()));
        let backend = backend(mock_client!(aws_sdk_s3, [&get]), "");
        let err = backend.get("missing.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::FileNotFound { op: Operation::Get, path } if path == "missing.txt"));
    }

    #[tokio::test]
    async fn test_invalid_path_never_reaches_the_service() {
        let get = mock!(aws_sdk_s3::Client::get_object).then_output(|| GetObjectOutput::builder().build());
        let backend = backend(mock_client!(aws_sdk_s3, [&get]), "");
        assert!(backend.get("../escape").await.unwrap_err().is_invalid_path());
        assert_eq!(get.num_calls(), 0);
    }

    #[tokio::test]
    async fn test_exists() {
        let found = mock!(aws_sdk_s3::Client::head_object)
            .match_requests(|req| req.key() == Some("present.txt"))
            .then_output(|| HeadObjectOutput::builder().content_length(3).build());
        let missing = mock!(aws_sdk_s3::Client::head_object)
            .match_requests(|req| req.key() == Some("absent.txt"))
            .then_error(|| HeadObjectError::NotFound(NotFound::builder().build()));
        let backend = backend(mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&found, &missing]), "");
        assert!(backend.exists("present.txt").await.unwrap());
        assert!(!backend.exists("absent.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_is_file_not_found() {
        let head = mock!(aws_sdk_s3::Client::head_object)
            .then_error(|| HeadObjectError::NotFound(NotFound::builder().build()));
        let delete = mock!(aws_sdk_s3::Client::delete_object).then_output(|| DeleteObjectOutput::builder().build());
        let backend = backend(mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&head, &delete]), "");
        let err = backend.delete("gone.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::FileNotFound { op: Operation::Delete, .. }));
        assert_eq!(delete.num_calls(), 0);
    }

    #[tokio::test]
    async fn test_get_metadata() {
        let head = mock!(aws_sdk_s3::Client::head_object)
            .match_requests(|req| req.key() == Some("meta.txt"))
            .then_output(|| {
                HeadObjectOutput::builder()
                    .content_type("text/plain")
                    .content_length(5)
                    .metadata("author", "someone")
                    .metadata(METADATA_MARKER, MARKER_TYPED)
                    .build()
            });
        // Uploaded by something else: a content type and headers, but no marker.
        let foreign = mock!(aws_sdk_s3::Client::head_object)
            .match_requests(|req| req.key() == Some("foreign.txt"))
            .then_output(|| {
                HeadObjectOutput::builder()
                    .content_type("text/plain")
                    .content_length(5)
                    .metadata("author", "someone")
                    .build()
            });
        let bare = mock!(aws_sdk_s3::Client::head_object)
            .match_requests(|req| req.key() == Some("bare.txt"))
            .then_output(|| HeadObjectOutput::builder().content_type("binary/octet-stream").content_length(5).build());
        let backend = backend(mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&head, &foreign, &bare]), "");

        let metadata = backend.get_metadata("meta.txt").await.unwrap().unwrap();
        assert_eq!(metadata.content_type, "text/plain");
        assert_eq!(metadata.size, 5);
        assert_eq!(
            metadata.custom_headers,
            HashMap::from([("author".to_string(), "someone".to_string())])
        );
        assert_eq!(backend.get_metadata("foreign.txt").await.unwrap(), None);
        assert_eq!(backend.get_metadata("bare.txt").await.unwrap(), None);
    }

    #[rstest]
    #[case(Metadata::new("application/octet-stream"), "application/octet-stream")]
    #[case(Metadata::new("binary/octet-stream").with_header("k", "v"), "binary/octet-stream")]
    // No content type given; the service fills in its own.
    #[case(Metadata::default(), "binary/octet-stream")]
    #[tokio::test]
    async fn test_metadata_round_trips_with_default_content_types(
        #[case] metadata: Metadata,
        #[case] stored_content_type: &'static str,
    ) {
        let (content_type, user_metadata) = native_metadata(Some(&metadata));
        let put = mock!(aws_sdk_s3::Client::put_object)
            .match_requests(move |req| {
                req.content_type() == content_type.as_deref() && req.metadata() == user_metadata.as_ref()
            })
            .then_output(|| PutObjectOutput::builder().build());
        let (_, user_metadata) = native_metadata(Some(&metadata));
        let head = mock!(aws_sdk_s3::Client::head_object).then_output(move || {
            HeadObjectOutput::builder()
                .content_type(stored_content_type)
                .content_length(3)
                .set_metadata(user_metadata.clone())
                .build()
        });
        let backend = backend(mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&put, &head]), "");

        backend.put_with_metadata("blob.bin", b"abc", &metadata).await.unwrap();
        assert_eq!(put.num_calls(), 1);
        let stored = backend.get_metadata("blob.bin").await.unwrap().unwrap();
        assert_eq!(stored.content_type, metadata.content_type);
        assert_eq!(stored.custom_headers, metadata.custom_headers);
        assert_eq!(stored.size, 3);
    }

    #[tokio::test]
    async fn test_put_with_metadata_sends_native_fields() {
        let put = mock!(aws_sdk_s3::Client::put_object)
            .match_requests(|req| {
                req.key() == Some("doc.json")
                    && req.content_type() == Some("application/json")
                    && req.metadata().and_then(|m| m.get("version")).map(String::as_str) == Some("2")
                    && req.metadata().and_then(|m| m.get(METADATA_MARKER)).map(String::as_str) == Some(MARKER_TYPED)
            })
            .then_output(|| PutObjectOutput::builder().build());
        let backend = backend(mock_client!(aws_sdk_s3, [&put]), "");
        let metadata = Metadata::new("application/json").with_header("version", "2");
        backend.put_with_metadata("doc.json", b"{}", &metadata).await.unwrap();
        assert_eq!(put.num_calls(), 1);
    }

    fn http_response(status: u16, body: &'static str) -> HttpResponse {
        HttpResponse::new(status.try_into().unwrap(), SdkBody::from(body))
    }

    #[tokio::test]
    async fn test_missing_bucket_is_not_file_not_found() {
        let put = mock!(aws_sdk_s3::Client::put_object).then_http_response(|| {
            http_response(404, "<Error><Code>NoSuchBucket</Code><Message>The specified bucket does not exist</Message></Error>")
        });
        let backend = backend(mock_client!(aws_sdk_s3, [&put]), "");
        let err = backend.put("file.txt", b"data").await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(&*err, ErrorKind::Network { op: Operation::Put, .. }));
    }

    #[tokio::test]
    async fn test_bodiless_404_is_file_not_found() {
        let get = mock!(aws_sdk_s3::Client::get_object).then_http_response(|| http_response(404, ""));
        let backend = backend(mock_client!(aws_sdk_s3, [&get]), "");
        let err = backend.get("missing.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::FileNotFound { op: Operation::Get, .. }));
    }

    #[tokio::test]
    async fn test_small_stream_is_a_single_put() {
        let put = mock!(aws_sdk_s3::Client::put_object)
            .match_requests(|req| req.key() == Some("small.bin"))
            .then_output(|| PutObjectOutput::builder().build());
        let backend = backend(mock_client!(aws_sdk_s3, [&put]), "");
        backend.put_stream("small.bin", Box::pin(&b"tiny payload"[..]), None).await.unwrap();
        assert_eq!(put.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_list_paginates_and_synthesizes_directories() {
        let first = mock!(aws_sdk_s3::Client::list_objects_v2)
            .match_requests(|req| req.prefix() == Some("tenant/") && req.continuation_token().is_none())
            .then_output(|| {
                ListObjectsV2Output::builder()
                    .contents(Object::builder().key("tenant/a/b/c.txt").size(2).build())
                    .contents(Object::builder().key("tenant/top.txt").size(3).build())
                    .is_truncated(true)
                    .next_continuation_token("page-2")
                    .build()
            });
        let second = mock!(aws_sdk_s3::Client::list_objects_v2)
            .match_requests(|req| req.continuation_token() == Some("page-2"))
            .then_output(|| {
                ListObjectsV2Output::builder()
                    .contents(Object::builder().key("tenant/a/d.txt").size(4).build())
                    .contents(Object::builder().key("tenant/empty/").size(0).build())
                    .is_truncated(false)
                    .build()
            });
        let backend = backend(mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&first, &second]), "tenant");

        let files = backend.list("").await.unwrap();
        let entries: Vec<_> = files.iter().map(|f| (f.path.as_str(), f.is_dir, f.size)).collect();
        assert_eq!(
            entries,
            vec![
                ("a", true, 0),
                ("a/b", true, 0),
                ("a/b/c.txt", false, 2),
                ("top.txt", false, 3),
                ("a/d.txt", false, 4),
                ("empty", true, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_prefix_is_component_based() {
        let list = mock!(aws_sdk_s3::Client::list_objects_v2)
            .match_requests(|req| req.prefix() == Some("dir1/"))
            .then_output(|| {
                ListObjectsV2Output::builder()
                    .contents(Object::builder().key("dir1/file.txt").size(1).build())
                    .is_truncated(false)
                    .build()
            });
        let backend = backend(mock_client!(aws_sdk_s3, [&list]), "");
        let files = backend.list("dir1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "dir1/file.txt");
    }
}
