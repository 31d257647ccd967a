//! Read-only storage backend.
//!
//! This module provides a storage backend implementation that wraps other
//! implementations and refuses write operations before they reach the inner
//! backend.

use async_trait::async_trait;

use crate::backend::{BoxAsyncRead, FileInfoStream};
use crate::error::{ErrorKind, Operation, Result};
use crate::models::{FileInfo, Metadata};
use crate::path::checked;
use crate::{BackendHandle, StorageBackend};

/// Read-only storage backend.
///
/// Wraps another backend and rejects all write operations with
/// [`OperationNotSupported`](ErrorKind::OperationNotSupported), logging an
/// [`info event`](tracing::Event). Paths are still validated first, so an
/// invalid path is reported as such rather than as a refused write.
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }

    fn refuse(&self, op: Operation, path: &str) -> Result<()> {
        checked(op, path)?;
        tracing::info!(disk = self.inner.name(), %op, path, "Refusing write to read-only disk");
        exn::bail!(ErrorKind::not_supported(op, path))
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, path: &str, _data: &[u8]) -> Result<()> {
        self.refuse(Operation::Put, path)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.refuse(Operation::Delete, path)
    }

    async fn put_stream(&self, path: &str, _reader: BoxAsyncRead, _metadata: Option<&Metadata>) -> Result<()> {
        self.refuse(Operation::PutStream, path)
    }

    async fn get_stream(&self, path: &str) -> Result<BoxAsyncRead> {
        self.inner.get_stream(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn size(&self, path: &str) -> Result<u64> {
        self.inner.size(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<FileInfo>> {
        self.inner.list(prefix).await
    }

    fn list_stream<'a>(&'a self, prefix: &'a str) -> FileInfoStream<'a> {
        self.inner.list_stream(prefix)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        checked(Operation::Copy, from)?;
        self.refuse(Operation::Copy, to)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        checked(Operation::Move, to)?;
        self.refuse(Operation::Move, from)
    }

    async fn put_with_metadata(&self, path: &str, _data: &[u8], _metadata: &Metadata) -> Result<()> {
        self.refuse(Operation::PutWithMetadata, path)
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<Metadata>> {
        self.inner.get_metadata(path).await
    }

    async fn set_metadata(&self, path: &str, _metadata: &Metadata) -> Result<()> {
        self.refuse(Operation::SetMetadata, path)
    }
}
