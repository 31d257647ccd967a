//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, which provides a unified
//! interface for storage operations across different backends (local filesystem,
//! S3-compatible services, etc.).
//!

mod local;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod ro;
#[cfg(feature = "s3")]
mod s3;
mod s3_config;

pub use self::local::{LocalBackend, LocalConfig};
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockBackend;
pub use self::ro::ReadOnlyBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
pub use self::s3_config::S3Config;
use crate::error::Result;
use crate::models::{FileInfo, Metadata};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::pin::Pin;
use tokio::io::AsyncRead;

pub type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;
/// An owned byte source. Dropping it releases the underlying file descriptor
/// or connection, so release happens on every exit path including unwinding.
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send + 'static>>;

/// Unified interface for storage backends.
///
/// All storage operations are asynchronous to efficiently handle network
/// operations and concurrent access. Every backend must be observably
/// identical through this interface; callers should never need to know which
/// one they are talking to.
///
/// # Path Handling
/// All paths are relative to the storage root. Implementations must run every
/// path through [`validate_path`](crate::validate_path) (prefixes through
/// [`validate_prefix`](crate::validate_prefix)) before deriving a physical
/// location from it, and must never trust a path validated elsewhere.
///
/// # Errors
/// Every error names the failed [`Operation`](crate::error::Operation) and
/// the path as the caller supplied it. Missing content is always
/// [`FileNotFound`](crate::error::ErrorKind::FileNotFound), never a
/// backend-specific error.
///
/// # Examples
///
/// ```
/// use depot_storage::{backend::StorageBackend, error::Result};
///
/// async fn size_or_zero(backend: &dyn StorageBackend) -> Result<u64> {
///     if backend.exists("path/to/file.txt").await? {
///         backend.size("path/to/file.txt").await
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Write file contents.
    ///
    /// Creates a new file or replaces an existing one (including any metadata
    /// previously recorded for it). Missing parent directories are created.
    async fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read file contents.
    ///
    /// Returns [`FileNotFound`](crate::error::ErrorKind::FileNotFound) if the
    /// file does not exist.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a file, and any metadata recorded for it.
    ///
    /// Returns [`FileNotFound`](crate::error::ErrorKind::FileNotFound) if the
    /// file does not exist, including when it was already deleted.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Write file contents from a byte source without holding the whole
    /// payload in memory.
    ///
    /// When `metadata` is supplied it is recorded once the content is written,
    /// as if by a subsequent [`set_metadata()`](Self::set_metadata).
    ///
    /// ```no_run
    /// use depot_storage::{Metadata, backend::StorageBackend};
    /// # async fn example(backend: &dyn StorageBackend) -> depot_storage::error::Result<()> {
    /// let file = tokio::fs::File::open("/tmp/upload.bin").await.unwrap();
    /// let metadata = Metadata::new("application/octet-stream");
    /// backend.put_stream("uploads/blob.bin", Box::pin(file), Some(&metadata)).await?;
    /// # Ok(())
    /// # }
    /// ```
    async fn put_stream(&self, path: &str, reader: BoxAsyncRead, metadata: Option<&Metadata>) -> Result<()>;

    /// Open a file for streaming reads.
    ///
    /// The returned reader is owned by the caller; dropping it closes the
    /// underlying file or connection. Returns
    /// [`FileNotFound`](crate::error::ErrorKind::FileNotFound) if the file
    /// does not exist.
    ///
    /// ```no_run
    /// use tokio::io::AsyncReadExt;
    /// # use depot_storage::backend::StorageBackend;
    /// # async fn example(backend: &dyn StorageBackend) -> depot_storage::error::Result<()> {
    /// let mut reader = backend.get_stream("logs/today.log").await?;
    /// let mut head = [0u8; 16];
    /// let _ = reader.read(&mut head).await;
    /// # Ok(())
    /// # }
    /// ```
    async fn get_stream(&self, path: &str) -> Result<BoxAsyncRead>;

    /// Check if a file exists.
    ///
    /// Absence is `Ok(false)`, never an error; only validation and genuine
    /// I/O failures are reported.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Size of the file contents in bytes.
    async fn size(&self, path: &str) -> Result<u64>;

    /// List every file and directory below `prefix` (`""` for everything).
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`list_stream()`](Self::list_stream) into a [`Vec`] before
    /// returning. Order is unspecified.
    async fn list(&self, prefix: &str) -> Result<Vec<FileInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream entries below `prefix`, yielding results incrementally.
    ///
    /// # Notes
    /// - Prefixes match whole path segments: `dir1` matches `dir1/x` but not
    ///   `dir10/x`.
    /// - The prefix entry itself is never yielded, and neither is any
    ///   backend-internal bookkeeping (e.g. metadata sidecars).
    /// - A prefix that doesn't exist yields nothing rather than an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// # use depot_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream("invoices");
    /// while let Some(info) = stream.try_next().await? {
    ///     if !info.is_dir {
    ///         println!("{}: {} bytes", info.path, info.size);
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: &'a str) -> FileInfoStream<'a>;

    /// Copy a file (and its metadata, if any) within the same backend.
    ///
    /// The source is left untouched; the destination is overwritten if it
    /// exists. A source without metadata leaves the destination without
    /// metadata too.
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Move a file within the same backend.
    ///
    /// Equivalent to [`copy()`](Self::copy) followed by
    /// [`delete()`](Self::delete) of the source. If the delete fails the
    /// copy is **not** undone; the content then exists at both paths.
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    /// Write file contents and record metadata for them.
    ///
    /// If recording the metadata fails, the content stays written.
    async fn put_with_metadata(&self, path: &str, data: &[u8], metadata: &Metadata) -> Result<()>;

    /// Read back recorded metadata.
    ///
    /// Returns `Ok(None)` for a file that exists but never had metadata
    /// recorded; that is not an error. Returns
    /// [`FileNotFound`](crate::error::ErrorKind::FileNotFound) if the file
    /// itself does not exist.
    async fn get_metadata(&self, path: &str) -> Result<Option<Metadata>>;

    /// Replace the metadata recorded for an existing file.
    ///
    /// No merge happens: custom headers absent from `metadata` are dropped.
    async fn set_metadata(&self, path: &str, metadata: &Metadata) -> Result<()>;
}
