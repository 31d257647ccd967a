//! Local filesystem storage backend.
//!
//! This module provides a storage backend implementation for the local filesystem.
//! Files are stored in a configured directory and accessed using standard filesystem
//! operations via `tokio::fs` for async I/O.
//!
//! Metadata lives in a JSON sidecar next to the content it describes
//! (`<path>.metadata.json`). Sidecars are bookkeeping, never content: they
//! are hidden from listings and follow their content through copy, move and
//! delete. Paths that would name a sidecar are rejected.

use crate::backend::{BoxAsyncRead, FileInfoStream};
use crate::error::{ErrorKind, Operation, Result};
use crate::models::{FileInfo, Metadata};
use crate::path::{PathRejection, checked, checked_prefix};
use crate::StorageBackend;
use async_stream::stream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::Metadata as FsMetadata;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncWriteExt;

/// Suffix appended to a file's location to address its metadata sidecar.
pub const METADATA_SUFFIX: &str = ".metadata.json";

const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Configuration for a [`LocalBackend`].
///
/// # Examples
///
/// ```
/// use depot_storage::backend::LocalConfig;
///
/// let config = LocalConfig::new("/srv/uploads").create_root(false).file_mode(0o600);
/// assert_eq!(config.dir_mode, 0o755);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalConfig {
    /// Root directory; every stored path lives below it.
    pub root: PathBuf,
    /// Create the root directory (and its parents) if it is missing. When
    /// `false`, the root must already exist and be a directory.
    #[serde(default = "default_create_root")]
    pub create_root: bool,
    /// Permission bits for created directories (Unix only).
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,
    /// Permission bits for created files (Unix only).
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}
impl LocalConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            create_root: default_create_root(),
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn create_root(mut self, create_root: bool) -> Self {
        self.create_root = create_root;
        self
    }

    pub fn dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }
}

fn default_create_root() -> bool {
    true
}

fn default_dir_mode() -> u32 {
    DEFAULT_DIR_MODE
}

fn default_file_mode() -> u32 {
    DEFAULT_FILE_MODE
}

/// On-disk shape of a metadata sidecar.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    custom_headers: HashMap<String, String>,
}
impl From<&Metadata> for Sidecar {
    fn from(metadata: &Metadata) -> Self {
        Self {
            content_type: metadata.content_type.clone(),
            custom_headers: metadata.custom_headers.clone(),
        }
    }
}
impl Sidecar {
    fn into_metadata(self, content: &FsMetadata) -> Metadata {
        Metadata {
            content_type: self.content_type,
            size: content.len(),
            last_modified: content.modified().ok().map(OffsetDateTime::from),
            custom_headers: self.custom_headers,
        }
    }
}

enum WalkEntry {
    File(FileInfo),
    Directory(FileInfo, PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// Stores files in a directory on the local filesystem. All paths are relative
/// to the configured root directory.
///
/// # Examples
///
/// ```no_run
/// use depot_storage::backend::{LocalBackend, LocalConfig};
///
/// # fn example() -> depot_storage::error::Result<()> {
/// let backend = LocalBackend::new("local", LocalConfig::new("/path/to/storage"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for the disk
    root: PathBuf,
    dir_mode: u32,
    file_mode: u32,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// A relative root is resolved against the current working directory.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidConfig`](ErrorKind::InvalidConfig) if the root is
    /// empty, exists but is not a directory, or is missing while
    /// `create_root` is `false`.
    pub fn new(name: impl Into<String>, config: LocalConfig) -> Result<Self> {
        if config.root.as_os_str().is_empty() {
            exn::bail!(ErrorKind::InvalidConfig("local root directory is required".to_string()));
        }
        let display = config.root.display().to_string();
        let root = std::path::absolute(&config.root).map_err(|e| ErrorKind::io(Operation::Init, &display, e))?;

        // Use non-async here; it'll only happen once on disk registration
        // and it's not worth the hassle of making the constructor async.
        match std::fs::metadata(&root) {
            Ok(metadata) if metadata.is_dir() => {},
            Ok(_) => exn::bail!(ErrorKind::InvalidConfig(format!("`{display}` exists but is not a directory"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && config.create_root => {
                let mut builder = std::fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                std::os::unix::fs::DirBuilderExt::mode(&mut builder, config.dir_mode);
                builder.create(&root).map_err(|e| ErrorKind::io(Operation::Init, &display, e))?;
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                exn::bail!(ErrorKind::InvalidConfig(format!("root directory `{display}` does not exist")))
            },
            Err(e) => exn::bail!(ErrorKind::io(Operation::Init, &display, e)),
        }

        Ok(Self {
            name: name.into(),
            root,
            dir_mode: config.dir_mode,
            file_mode: config.file_mode,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a caller path, additionally refusing any segment that would
    /// address (or hide behind) a metadata sidecar.
    fn content_path(op: Operation, raw: &str) -> Result<String> {
        let normalized = checked(op, raw)?;
        if normalized.split('/').any(|segment| segment.ends_with(METADATA_SUFFIX)) {
            exn::bail!(ErrorKind::InvalidPath {
                op,
                path: raw.to_string(),
                reason: PathRejection::Reserved,
            });
        }
        Ok(normalized)
    }

    /// Physical location of an already-validated path.
    fn location(&self, normalized: &str) -> PathBuf {
        self.root.join(normalized)
    }

    fn sidecar_location(&self, normalized: &str) -> PathBuf {
        self.root.join(format!("{normalized}{METADATA_SUFFIX}"))
    }

    /// Convert an absolute location back to a relative, forward-slash path.
    /// Returns `None` for anything outside the root or not valid UTF-8.
    fn relative_path(&self, absolute: &Path) -> Option<String> {
        let relative = absolute.strip_prefix(&self.root).ok()?;
        let segments = relative.components().map(|c| c.as_os_str().to_str()).collect::<Option<Vec<_>>>()?;
        Some(segments.join("/"))
    }

    async fn create_dirs(&self, dir: &Path) -> std::io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(self.dir_mode);
        builder.create(dir).await
    }

    /// Create (or truncate) a file, creating parent directories as needed to
    /// keep behaviour consistent with S3-compatible storage.
    async fn create_file(&self, location: &Path) -> std::io::Result<fs::File> {
        if let Some(parent) = location.parent() {
            self.create_dirs(parent).await?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(self.file_mode);
        options.open(location).await
    }

    async fn write_file(&self, location: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.create_file(location).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    /// Filesystem metadata for a regular file, or `None` when nothing that
    /// counts as content lives there (missing, a directory, or a path through
    /// a file).
    async fn file_metadata(location: &Path) -> std::io::Result<Option<FsMetadata>> {
        match fs::metadata(location).await {
            Ok(metadata) => Ok(Some(metadata).filter(FsMetadata::is_file)),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Like [`file_metadata()`](Self::file_metadata), reporting anything that
    /// isn't a regular file as [`FileNotFound`](ErrorKind::FileNotFound).
    async fn require_file(&self, op: Operation, raw: &str, location: &Path) -> Result<FsMetadata> {
        let metadata = Self::file_metadata(location).await.map_err(|e| ErrorKind::io(op, raw, e))?;
        Ok(metadata.ok_or_else(|| ErrorKind::not_found(op, raw))?)
    }

    async fn write_content(&self, op: Operation, raw: &str, normalized: &str, data: &[u8]) -> Result<()> {
        self.write_file(&self.location(normalized), data).await.map_err(|e| ErrorKind::io(op, raw, e))?;
        Ok(())
    }

    async fn write_sidecar(&self, op: Operation, raw: &str, normalized: &str, metadata: &Metadata) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(&Sidecar::from(metadata)).map_err(|source| ErrorKind::InvalidMetadata {
            op,
            path: raw.to_string(),
            source,
        })?;
        self.write_file(&self.sidecar_location(normalized), &encoded).await.map_err(|e| ErrorKind::io(op, raw, e))?;
        Ok(())
    }

    async fn read_sidecar(&self, op: Operation, raw: &str, normalized: &str) -> Result<Option<Sidecar>> {
        let encoded = match fs::read(self.sidecar_location(normalized)).await {
            Ok(encoded) => encoded,
            // No metadata is not an error.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => exn::bail!(ErrorKind::io(op, raw, e)),
        };
        let sidecar = serde_json::from_slice(&encoded).map_err(|source| ErrorKind::InvalidMetadata {
            op,
            path: raw.to_string(),
            source,
        })?;
        Ok(Some(sidecar))
    }

    /// Best-effort removal of a sidecar whose content is gone or was replaced.
    async fn remove_sidecar(&self, normalized: &str) {
        match fs::remove_file(self.sidecar_location(normalized)).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => tracing::warn!(disk = %self.name, path = normalized, error = %e, "Failed to remove stale metadata sidecar"),
        }
    }

    /// Make the sidecar at `to` mirror the one at `from`: copied (or moved)
    /// when present, removed when not.
    async fn transfer_sidecar(&self, op: Operation, raw_to: &str, from: &str, to: &str) -> Result<()> {
        let (source, target) = (self.sidecar_location(from), self.sidecar_location(to));
        let transferred = match op {
            Operation::Move => fs::rename(&source, &target).await,
            _ => fs::copy(&source, &target).await.map(|_| ()),
        };
        match transferred {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.remove_sidecar(to).await;
                Ok(())
            },
            Err(e) => exn::bail!(ErrorKind::io(op, raw_to, e)),
        }
    }

    /// Shared body of copy and move; `op` selects which filesystem primitive
    /// carries the content across.
    async fn transfer(&self, op: Operation, from: &str, to: &str) -> Result<()> {
        let source = Self::content_path(op, from)?;
        let target = Self::content_path(op, to)?;
        let source_location = self.location(&source);
        self.require_file(op, from, &source_location).await?;
        if source == target {
            return Ok(());
        }
        let target_location = self.location(&target);
        if let Some(parent) = target_location.parent() {
            self.create_dirs(parent).await.map_err(|e| ErrorKind::io(op, to, e))?;
        }
        let transferred = match op {
            Operation::Move => fs::rename(&source_location, &target_location).await,
            _ => fs::copy(&source_location, &target_location).await.map(|_| ()),
        };
        transferred.map_err(|e| ErrorKind::io(op, to, e))?;
        self.transfer_sidecar(op, to, &source, &target).await
    }

    /// Metadata for a listed file; a sidecar that can't be read shouldn't
    /// sink the entire listing.
    async fn listing_metadata(&self, relative: &str, content: &FsMetadata) -> Option<Metadata> {
        match self.read_sidecar(Operation::List, relative, relative).await {
            Ok(sidecar) => sidecar.map(|s| s.into_metadata(content)),
            Err(e) => {
                tracing::warn!(disk = %self.name, path = relative, error = %e, "Ignoring unreadable metadata sidecar");
                None
            },
        }
    }

    /// Classify one directory entry for the listing walk. Lives outside the
    /// stream so errors can use `?` instead of yield-and-continue.
    async fn process_entry(&self, entry: DirEntry, prefix: &str) -> Result<WalkEntry> {
        let path = entry.path();
        let is_sidecar = entry.file_name().to_str().is_some_and(|name| name.ends_with(METADATA_SUFFIX));
        let Some(relative) = self.relative_path(&path) else {
            tracing::warn!(disk = %self.name, path = %path.display(), "Skipping entry with a non UTF-8 name");
            return Ok(WalkEntry::Skip);
        };
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::io(Operation::List, prefix, e))?;
        let modified = metadata.modified().map_err(|e| ErrorKind::io(Operation::List, prefix, e))?.into();
        if metadata.is_dir() {
            return Ok(WalkEntry::Directory(FileInfo::directory(relative, modified), path));
        }
        if metadata.is_file() && !is_sidecar {
            let sidecar = self.listing_metadata(&relative, &metadata).await;
            return Ok(WalkEntry::File(FileInfo::file(relative, metadata.len(), modified).with_metadata(sidecar)));
        }
        // Note: silently drop sidecars and symlinks (most likely broken ones).
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let normalized = Self::content_path(Operation::Put, path)?;
        self.write_content(Operation::Put, path, &normalized, data).await?;
        self.remove_sidecar(&normalized).await;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let location = self.location(&Self::content_path(Operation::Get, path)?);
        self.require_file(Operation::Get, path, &location).await?;
        Ok(fs::read(&location).await.map_err(|e| ErrorKind::io(Operation::Get, path, e))?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let normalized = Self::content_path(Operation::Delete, path)?;
        let location = self.location(&normalized);
        self.require_file(Operation::Delete, path, &location).await?;
        fs::remove_file(&location).await.map_err(|e| ErrorKind::io(Operation::Delete, path, e))?;
        self.remove_sidecar(&normalized).await;
        Ok(())
    }

    async fn put_stream(&self, path: &str, mut reader: BoxAsyncRead, metadata: Option<&Metadata>) -> Result<()> {
        let op = Operation::PutStream;
        let normalized = Self::content_path(op, path)?;
        let mut file = self.create_file(&self.location(&normalized)).await.map_err(|e| ErrorKind::io(op, path, e))?;
        tokio::io::copy(&mut reader, &mut file).await.map_err(|e| ErrorKind::io(op, path, e))?;
        file.flush().await.map_err(|e| ErrorKind::io(op, path, e))?;
        match metadata {
            Some(metadata) => self.write_sidecar(op, path, &normalized, metadata).await,
            None => {
                self.remove_sidecar(&normalized).await;
                Ok(())
            },
        }
    }

    async fn get_stream(&self, path: &str) -> Result<BoxAsyncRead> {
        let op = Operation::GetStream;
        let location = self.location(&Self::content_path(op, path)?);
        // Opening a directory succeeds on Unix, so check what we're about to hand out.
        self.require_file(op, path, &location).await?;
        let file = fs::File::open(&location).await.map_err(|e| ErrorKind::io(op, path, e))?;
        Ok(Box::pin(file))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let location = self.location(&Self::content_path(Operation::Exists, path)?);
        let metadata = Self::file_metadata(&location).await.map_err(|e| ErrorKind::io(Operation::Exists, path, e))?;
        Ok(metadata.is_some())
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let location = self.location(&Self::content_path(Operation::Size, path)?);
        Ok(self.require_file(Operation::Size, path, &location).await?.len())
    }

    // I know two things:
    // 1. Async streams are really hard to wrap my head around, and
    // 2. I do not know of a better way to get performant code.
    fn list_stream<'a>(&'a self, prefix: &'a str) -> FileInfoStream<'a> {
        let validated_prefix = match checked_prefix(Operation::List, prefix) {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        // Prefixes are whole directories: walk from the prefix itself so
        // neither the prefix entry nor its siblings (`dir10` for `dir1`) are
        // ever visited.
        let start_dir = self.location(&validated_prefix);
        let mut stack = vec![start_dir];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // To stay consistent with the behaviour of S3-compatible
                    // backends, asking for the contents of a directory that
                    // doesn't exist (or is a file) results in an empty list
                    // not an error.
                    Err(err) => {
                        let is_dir = fs::metadata(&current).await.is_ok_and(|m| m.is_dir());
                        if err.kind() == std::io::ErrorKind::NotFound || !is_dir {
                            continue 'dirs;
                        }
                        yield Err(exn::Exn::from(ErrorKind::io(Operation::List, prefix, err)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(ErrorKind::io(Operation::List, prefix, e))); break 'entries; },
                    };
                    match self.process_entry(entry, prefix).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Directory(d, location)) => {
                            stack.push(location);
                            yield Ok(d);
                        },
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.transfer(Operation::Copy, from, to).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.transfer(Operation::Move, from, to).await
    }

    async fn put_with_metadata(&self, path: &str, data: &[u8], metadata: &Metadata) -> Result<()> {
        let op = Operation::PutWithMetadata;
        let normalized = Self::content_path(op, path)?;
        self.write_content(op, path, &normalized, data).await?;
        self.write_sidecar(op, path, &normalized, metadata).await
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<Metadata>> {
        let op = Operation::GetMetadata;
        let normalized = Self::content_path(op, path)?;
        let content = self.require_file(op, path, &self.location(&normalized)).await?;
        Ok(self.read_sidecar(op, path, &normalized).await?.map(|sidecar| sidecar.into_metadata(&content)))
    }

    async fn set_metadata(&self, path: &str, metadata: &Metadata) -> Result<()> {
        let op = Operation::SetMetadata;
        let normalized = Self::content_path(op, path)?;
        self.require_file(op, path, &self.location(&normalized)).await?;
        self.write_sidecar(op, path, &normalized, metadata).await
    }
}
