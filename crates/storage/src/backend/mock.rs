//! In-memory storage backend for testing.

use super::{BoxAsyncRead, FileInfoStream};
use crate::error::{ErrorKind, Operation, Result};
use crate::models::{FileInfo, Metadata};
use crate::path::{ancestors_below, checked, checked_prefix, is_below, validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use crate::StorageBackend;

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    modified: OffsetDateTime,
    metadata: Option<Metadata>,
}
impl Entry {
    fn new(data: Vec<u8>, metadata: Option<Metadata>) -> Self {
        Self {
            data,
            modified: OffsetDateTime::now_utc(),
            metadata,
        }
    }

    /// Recorded metadata, with the content-derived fields filled in.
    fn described(&self) -> Option<Metadata> {
        self.metadata.clone().map(|metadata| Metadata {
            size: self.data.len() as u64,
            last_modified: Some(self.modified),
            ..metadata
        })
    }
}

/// In-memory storage backend for testing.
///
/// Files are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. Ideal for unit
/// tests that need a [`StorageBackend`] without filesystem or network
/// dependencies.
///
/// Like object storage, there are no real directories: listings synthesize
/// them from the stored paths, and `exists()` only ever reports files.
///
/// # Examples
///
/// ```
/// use depot_storage::backend::{MockBackend, StorageBackend};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("invoices/2024-01.pdf", b"%PDF-1.7"),
/// ]);
/// assert!(backend.exists("invoices/2024-01.pdf").await?);
///
/// backend.put("invoices/2024-02.pdf", b"%PDF-1.7").await?;
/// assert!(backend.exists("invoices/2024-02.pdf").await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<String, Entry>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    ///
    /// # Example
    ///
    /// ```
    /// use depot_storage::backend::MockBackend;
    ///
    /// let backend = MockBackend::with_files([
    ///     ("one.txt", b"data file 1"),
    ///     ("dir/two.txt", b"data file 2"),
    /// ]);
    /// ```
    pub fn with_files(files: impl IntoIterator<Item = (impl AsRef<str>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        for (path, data) in files {
            let path = path.as_ref();
            let Ok(validated) = validate_path(path) else {
                // The panic here is DELIBERATE. MockBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockBackend::with_files: invalid path {path:?}");
            };
            map.insert(validated, Entry::new(data.into(), None));
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
        }
    }

    /// Change the name of the mock backend.
    ///
    /// # Example
    ///
    /// ```
    /// use depot_storage::backend::MockBackend;
    ///
    /// let backend = MockBackend::default().with_name("test");
    /// ```
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn insert(&self, op: Operation, path: &str, data: Vec<u8>, metadata: Option<Metadata>) -> Result<()> {
        let path = checked(op, path)?;
        self.storage.write().await.insert(path, Entry::new(data, metadata));
        Ok(())
    }

    async fn entry(&self, op: Operation, path: &str) -> Result<Entry> {
        let normalized = checked(op, path)?;
        let guard = self.storage.read().await;
        let entry = guard.get(&normalized).cloned().ok_or_else(|| ErrorKind::not_found(op, path))?;
        Ok(entry)
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.insert(Operation::Put, path, data.to_vec(), None).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.entry(Operation::Get, path).await?.data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let normalized = checked(Operation::Delete, path)?;
        match self.storage.write().await.remove(&normalized) {
            Some(_) => Ok(()),
            None => exn::bail!(ErrorKind::not_found(Operation::Delete, path)),
        }
    }

    async fn put_stream(&self, path: &str, mut reader: BoxAsyncRead, metadata: Option<&Metadata>) -> Result<()> {
        checked(Operation::PutStream, path)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.map_err(|e| ErrorKind::io(Operation::PutStream, path, e))?;
        self.insert(Operation::PutStream, path, data, metadata.cloned()).await
    }

    async fn get_stream(&self, path: &str) -> Result<BoxAsyncRead> {
        let data = self.entry(Operation::GetStream, path).await?.data;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = checked(Operation::Exists, path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn size(&self, path: &str) -> Result<u64> {
        Ok(self.entry(Operation::Size, path).await?.data.len() as u64)
    }

    fn list_stream<'a>(&'a self, prefix: &'a str) -> FileInfoStream<'a> {
        let validated_prefix = match checked_prefix(Operation::List, prefix) {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot matching entries under the read lock, then drop it
            // before yielding to avoid holding the lock across yield points.
            let mut entries: BTreeMap<String, FileInfo> = BTreeMap::new();
            {
                let guard = self.storage.read().await;
                for (path, entry) in guard.iter().filter(|(path, _)| is_below(&validated_prefix, path)) {
                    for dir in ancestors_below(&validated_prefix, path) {
                        entries.entry(dir.to_string()).or_insert_with(|| FileInfo::directory(dir, entry.modified));
                    }
                    let info = FileInfo::file(path.as_str(), entry.data.len() as u64, entry.modified);
                    entries.insert(path.clone(), info.with_metadata(entry.described()));
                }
            }
            for (_, info) in entries {
                yield Ok(info);
            }
        })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let target = checked(Operation::Copy, to)?;
        let entry = self.entry(Operation::Copy, from).await?;
        self.storage.write().await.insert(target, Entry::new(entry.data, entry.metadata));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = checked(Operation::Move, from)?;
        let target = checked(Operation::Move, to)?;
        let mut guard = self.storage.write().await;
        let entry = guard.remove(&source).ok_or_else(|| ErrorKind::not_found(Operation::Move, from))?;
        guard.insert(target, entry);
        Ok(())
    }

    async fn put_with_metadata(&self, path: &str, data: &[u8], metadata: &Metadata) -> Result<()> {
        self.insert(Operation::PutWithMetadata, path, data.to_vec(), Some(metadata.clone())).await
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<Metadata>> {
        Ok(self.entry(Operation::GetMetadata, path).await?.described())
    }

    async fn set_metadata(&self, path: &str, metadata: &Metadata) -> Result<()> {
        let normalized = checked(Operation::SetMetadata, path)?;
        let mut guard = self.storage.write().await;
        let entry = guard.get_mut(&normalized).ok_or_else(|| ErrorKind::not_found(Operation::SetMetadata, path))?;
        entry.metadata = Some(metadata.clone());
        Ok(())
    }
}
