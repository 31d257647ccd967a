//! Named disks.
//!
//! [`Storage`] owns the mapping from disk names to backends and dispatches
//! every operation to the backend registered under the requested name. It is
//! also the only place that knows about more than one backend at a time, so
//! copying and moving content between disks lives here.

use crate::backend::{BoxAsyncRead, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::models::{FileInfo, Metadata};
use crate::BackendHandle;
use async_stream::stream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::instrument;

/// Registry of named disks.
///
/// Cheap to share behind an [`Arc`](std::sync::Arc): every method takes
/// `&self`. The registry lock is only held long enough to clone a
/// [`BackendHandle`] out of the map, never across an await point, so
/// registering or removing a disk never waits for in-flight operations (and
/// an operation already dispatched to a removed disk runs to completion
/// against it).
///
/// # Examples
///
/// ```no_run
/// use depot_storage::Storage;
/// use depot_storage::backend::{LocalBackend, LocalConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> depot_storage::error::Result<()> {
/// let storage = Storage::new();
/// storage.add_disk("local", Arc::new(LocalBackend::new("local", LocalConfig::new("/srv/files"))?));
/// storage.put("local", "hello.txt", b"Hello, world!").await?;
/// assert_eq!(storage.get("local", "hello.txt").await?, b"Hello, world!");
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Storage {
    disks: RwLock<HashMap<String, BackendHandle>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under `name`, returning the backend previously
    /// registered under that name (if any).
    pub fn add_disk(&self, name: impl Into<String>, backend: BackendHandle) -> Option<BackendHandle> {
        let name = name.into();
        tracing::debug!(disk = %name, backend = backend.name(), "Registering disk");
        self.disks.write().unwrap_or_else(PoisonError::into_inner).insert(name, backend)
    }

    /// Unregister a disk. Removing a name that isn't registered does nothing.
    pub fn remove_disk(&self, name: &str) -> Option<BackendHandle> {
        self.disks.write().unwrap_or_else(PoisonError::into_inner).remove(name)
    }

    pub fn has_disk(&self, name: &str) -> bool {
        self.disks.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    /// Names of every registered disk, in no particular order.
    pub fn disk_names(&self) -> Vec<String> {
        self.disks.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Look up the backend registered under `name`.
    ///
    /// # Errors
    /// Returns [`DiskNotFound`](ErrorKind::DiskNotFound) if nothing is
    /// registered under that name.
    pub fn disk(&self, name: &str) -> Result<BackendHandle> {
        let disks = self.disks.read().unwrap_or_else(PoisonError::into_inner);
        let backend = disks.get(name).cloned().ok_or_else(|| ErrorKind::DiskNotFound(name.to_string()))?;
        Ok(backend)
    }

    #[instrument(level = "debug", skip(self, data), fields(bytes = data.len()))]
    pub async fn put(&self, disk: &str, path: &str, data: &[u8]) -> Result<()> {
        self.disk(disk)?.put(path, data).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, disk: &str, path: &str) -> Result<Vec<u8>> {
        self.disk(disk)?.get(path).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, disk: &str, path: &str) -> Result<()> {
        self.disk(disk)?.delete(path).await
    }

    #[instrument(level = "debug", skip(self, reader))]
    pub async fn put_stream(
        &self,
        disk: &str,
        path: &str,
        reader: BoxAsyncRead,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        self.disk(disk)?.put_stream(path, reader, metadata).await
    }

    /// The returned reader is owned by the caller; dropping it releases the
    /// underlying file or connection.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_stream(&self, disk: &str, path: &str) -> Result<BoxAsyncRead> {
        self.disk(disk)?.get_stream(path).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn exists(&self, disk: &str, path: &str) -> Result<bool> {
        self.disk(disk)?.exists(path).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn size(&self, disk: &str, path: &str) -> Result<u64> {
        self.disk(disk)?.size(path).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn list(&self, disk: &str, prefix: &str) -> Result<Vec<FileInfo>> {
        self.disk(disk)?.list(prefix).await
    }

    /// Streaming counterpart of [`list()`](Self::list). An unknown disk is
    /// reported as the stream's only item.
    pub fn list_stream<'a>(&'a self, disk: &'a str, prefix: &'a str) -> FileInfoStream<'a> {
        let backend = match self.disk(disk) {
            Ok(backend) => backend,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        Box::pin(stream! {
            let mut entries = backend.list_stream(prefix);
            while let Some(entry) = entries.next().await {
                yield entry;
            }
        })
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn copy(&self, disk: &str, from: &str, to: &str) -> Result<()> {
        self.disk(disk)?.copy(from, to).await
    }

    /// Move a file within one disk.
    #[instrument(level = "debug", skip(self))]
    pub async fn rename(&self, disk: &str, from: &str, to: &str) -> Result<()> {
        self.disk(disk)?.rename(from, to).await
    }

    #[instrument(level = "debug", skip(self, data), fields(bytes = data.len()))]
    pub async fn put_with_metadata(&self, disk: &str, path: &str, data: &[u8], metadata: &Metadata) -> Result<()> {
        self.disk(disk)?.put_with_metadata(path, data, metadata).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get_metadata(&self, disk: &str, path: &str) -> Result<Option<Metadata>> {
        self.disk(disk)?.get_metadata(path).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn set_metadata(&self, disk: &str, path: &str, metadata: &Metadata) -> Result<()> {
        self.disk(disk)?.set_metadata(path, metadata).await
    }

    /// Copy a file from one disk to another, metadata included.
    ///
    /// Content is read in full from the source before anything is written to
    /// the destination; nothing is streamed between backends. Metadata is
    /// carried over when it can be read, and silently left behind when it
    /// can't. Not transactional: a failed write leaves the source untouched
    /// and the destination in whatever state its backend left it.
    ///
    /// # Errors
    /// Returns [`DiskNotFound`](ErrorKind::DiskNotFound) before touching
    /// either backend if either disk is unregistered.
    #[instrument(level = "debug", skip(self))]
    pub async fn copy_between_disks(&self, from_disk: &str, to_disk: &str, from: &str, to: &str) -> Result<()> {
        let source = self.disk(from_disk)?;
        let target = self.disk(to_disk)?;
        transfer(&source, &target, from, to).await
    }

    /// [`copy_between_disks()`](Self::copy_between_disks), then delete the
    /// source.
    ///
    /// If the delete fails the copy is **not** undone: the content exists on
    /// both disks and the delete error is returned.
    #[instrument(level = "debug", skip(self))]
    pub async fn move_between_disks(&self, from_disk: &str, to_disk: &str, from: &str, to: &str) -> Result<()> {
        let source = self.disk(from_disk)?;
        let target = self.disk(to_disk)?;
        transfer(&source, &target, from, to).await?;
        if let Err(e) = source.delete(from).await {
            tracing::warn!(disk = from_disk, path = from, error = %e, "Moved file left behind on source disk");
            return Err(e);
        }
        Ok(())
    }
}

/// Read everything from `source`, then write it all to `target`.
async fn transfer(source: &BackendHandle, target: &BackendHandle, from: &str, to: &str) -> Result<()> {
    let data = source.get(from).await?;
    let metadata = match source.get_metadata(from).await {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::debug!(disk = source.name(), path = from, error = %e, "Copying without metadata");
            None
        },
    };
    match metadata {
        Some(metadata) => target.put_with_metadata(to, &data, &metadata).await,
        None => target.put(to, &data).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, ReadOnlyBackend};
    use crate::error::Operation;
    use crate::StorageBackend;
    use std::sync::Arc;

    fn storage() -> (Storage, Arc<MockBackend>, Arc<MockBackend>) {
        let a = Arc::new(MockBackend::default().with_name("a"));
        let b = Arc::new(MockBackend::default().with_name("b"));
        let storage = Storage::new();
        storage.add_disk("a", a.clone());
        storage.add_disk("b", b.clone());
        (storage, a, b)
    }

    #[test]
    fn test_registry() {
        let (storage, _, _) = storage();
        assert!(storage.has_disk("a"));
        assert!(!storage.has_disk("c"));
        let mut names = storage.disk_names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert!(storage.remove_disk("a").is_some());
        assert!(storage.remove_disk("a").is_none());
        assert!(!storage.has_disk("a"));
    }

    #[tokio::test]
    async fn test_add_disk_replaces_binding() {
        let (storage, _, _) = storage();
        storage.put("a", "file.txt", b"first").await.unwrap();
        let replacement = Arc::new(MockBackend::with_files([("file.txt", b"other")]).with_name("replacement"));
        let previous = storage.add_disk("a", replacement).unwrap();
        assert_eq!(previous.name(), "a");
        assert_eq!(storage.get("a", "file.txt").await.unwrap(), b"other");
        assert_eq!(storage.disk_names().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_disk() {
        let (storage, _, _) = storage();
        let err = storage.get("missing", "file.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DiskNotFound(name) if name == "missing"));
        assert!(storage.put("missing", "file.txt", b"data").await.unwrap_err().is_disk_not_found());
        let mut stream = storage.list_stream("missing", "");
        assert!(stream.next().await.unwrap().unwrap_err().is_disk_not_found());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch() {
        let (storage, a, b) = storage();
        storage.put("a", "dir/file.txt", b"data").await.unwrap();
        assert!(a.exists("dir/file.txt").await.unwrap());
        assert!(!b.exists("dir/file.txt").await.unwrap());
        assert_eq!(storage.size("a", "dir/file.txt").await.unwrap(), 4);
        assert_eq!(storage.list("a", "dir").await.unwrap().len(), 1);
        storage.rename("a", "dir/file.txt", "moved.txt").await.unwrap();
        assert!(!storage.exists("a", "dir/file.txt").await.unwrap());
        storage.copy("a", "moved.txt", "copied.txt").await.unwrap();
        storage.delete("a", "moved.txt").await.unwrap();
        assert_eq!(storage.get("a", "copied.txt").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_copy_between_disks() {
        let (storage, a, b) = storage();
        let metadata = Metadata::new("text/plain").with_header("origin", "a");
        a.put_with_metadata("src.txt", b"payload", &metadata).await.unwrap();
        storage.copy_between_disks("a", "b", "src.txt", "nested/dst.txt").await.unwrap();
        assert_eq!(b.get("nested/dst.txt").await.unwrap(), b"payload");
        assert_eq!(a.get("src.txt").await.unwrap(), b"payload");
        let copied = b.get_metadata("nested/dst.txt").await.unwrap().unwrap();
        assert_eq!(copied.custom_headers, metadata.custom_headers);
    }

    #[tokio::test]
    async fn test_copy_between_disks_without_metadata() {
        let (storage, a, b) = storage();
        a.put("src.txt", b"payload").await.unwrap();
        storage.copy_between_disks("a", "b", "src.txt", "dst.txt").await.unwrap();
        assert_eq!(b.get("dst.txt").await.unwrap(), b"payload");
        assert_eq!(b.get_metadata("dst.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_copy_between_disks_fails_fast_on_unknown_disk() {
        let (storage, a, _) = storage();
        a.put("src.txt", b"payload").await.unwrap();
        let err = storage.copy_between_disks("a", "nowhere", "src.txt", "dst.txt").await.unwrap_err();
        assert!(err.is_disk_not_found());
        let err = storage.copy_between_disks("nowhere", "a", "src.txt", "dst.txt").await.unwrap_err();
        assert!(err.is_disk_not_found());
    }

    #[tokio::test]
    async fn test_copy_between_disks_missing_source() {
        let (storage, _, b) = storage();
        let err = storage.copy_between_disks("a", "b", "missing.txt", "dst.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::FileNotFound { op: Operation::Get, .. }));
        assert!(!b.exists("dst.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_between_disks() {
        let (storage, a, b) = storage();
        a.put("src.txt", b"payload").await.unwrap();
        storage.move_between_disks("a", "b", "src.txt", "dst.txt").await.unwrap();
        assert!(!a.exists("src.txt").await.unwrap());
        assert_eq!(b.get("dst.txt").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_move_between_disks_keeps_copy_when_delete_fails() {
        let (storage, _, b) = storage();
        let archive = Arc::new(MockBackend::with_files([("src.txt", b"payload")]).with_name("archive"));
        storage.add_disk("archive", Arc::new(ReadOnlyBackend::new(archive.clone())));
        let err = storage.move_between_disks("archive", "b", "src.txt", "dst.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::OperationNotSupported { op: Operation::Delete, .. }));
        // Content now exists on both disks.
        assert!(archive.exists("src.txt").await.unwrap());
        assert_eq!(b.get("dst.txt").await.unwrap(), b"payload");
    }
}
