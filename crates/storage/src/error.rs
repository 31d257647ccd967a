//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Every failure raised by a backend carries the [`Operation`] that failed and
//! the path exactly as the caller supplied it (before normalization), so a
//! caller can tell `FileNotFound` apart from `InvalidPath` apart from a
//! genuine I/O failure without knowing which backend raised it.

use crate::path::PathRejection;
use derive_more::{Display, Error};
use std::io::Error as IoError;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The contract operation that was being performed when an error occurred.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    #[display("init")]
    Init,
    #[display("put")]
    Put,
    #[display("get")]
    Get,
    #[display("delete")]
    Delete,
    #[display("put_stream")]
    PutStream,
    #[display("get_stream")]
    GetStream,
    #[display("exists")]
    Exists,
    #[display("size")]
    Size,
    #[display("list")]
    List,
    #[display("copy")]
    Copy,
    #[display("move")]
    Move,
    #[display("put_with_metadata")]
    PutWithMetadata,
    #[display("get_metadata")]
    GetMetadata,
    #[display("set_metadata")]
    SetMetadata,
}

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No backend is registered under this disk name.
    #[display("disk not found: {_0}")]
    DiskNotFound(#[error(not(source))] String),
    /// Path or prefix failed validation (empty, traversal, null byte).
    #[display("{op} {path:?}: invalid path: {reason}")]
    InvalidPath {
        op: Operation,
        path: String,
        #[error(source)]
        reason: PathRejection,
    },
    /// Content is absent at a (valid) path.
    #[display("{op} {path:?}: file not found")]
    FileNotFound { op: Operation, path: String },
    /// The backend cannot perform this operation at all.
    #[display("{op} {path:?}: operation not supported")]
    OperationNotSupported { op: Operation, path: String },
    /// Underlying I/O error from the local filesystem.
    #[display("{op} {path:?}: I/O error: {source}")]
    Io { op: Operation, path: String, source: IoError },
    /// Object storage request failed (connection, credentials, service error).
    #[display("{op} {path:?}: network error: {message}")]
    Network { op: Operation, path: String, message: String },
    /// A metadata sidecar exists but could not be encoded or decoded.
    #[display("{op} {path:?}: invalid metadata: {source}")]
    InvalidMetadata {
        op: Operation,
        path: String,
        source: serde_json::Error,
    },
    /// A backend rejected its configuration during construction.
    #[display("invalid configuration: {_0}")]
    InvalidConfig(#[error(not(source))] String),
    /// A cancellation token fired or a deadline passed before completion.
    #[display("operation cancelled")]
    Cancelled,
}

impl ErrorKind {
    pub(crate) fn not_found(op: Operation, path: &str) -> Self {
        Self::FileNotFound { op, path: path.to_string() }
    }

    pub(crate) fn not_supported(op: Operation, path: &str) -> Self {
        Self::OperationNotSupported { op, path: path.to_string() }
    }

    /// Map a filesystem error, translating "entry absent" into
    /// [`FileNotFound`](Self::FileNotFound) rather than a generic I/O error.
    pub(crate) fn io(op: Operation, path: &str, source: IoError) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(op, path),
            _ => Self::Io { op, path: path.to_string(), source },
        }
    }

    #[cfg(any(test, feature = "s3"))]
    pub(crate) fn network(op: Operation, path: &str, message: impl Into<String>) -> Self {
        Self::Network {
            op,
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound { .. })
    }

    pub fn is_invalid_path(&self) -> bool {
        matches!(self, Self::InvalidPath { .. })
    }

    pub fn is_disk_not_found(&self) -> bool {
        matches!(self, Self::DiskNotFound(_))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Network { .. })
    }

    /// The operation that failed, if this error is tied to one.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::InvalidPath { op, .. }
            | Self::FileNotFound { op, .. }
            | Self::OperationNotSupported { op, .. }
            | Self::Io { op, .. }
            | Self::Network { op, .. }
            | Self::InvalidMetadata { op, .. } => Some(*op),
            Self::DiskNotFound(_) | Self::InvalidConfig(_) | Self::Cancelled => None,
        }
    }

    /// The path as originally supplied by the caller, if this error is tied
    /// to one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::InvalidPath { path, .. }
            | Self::FileNotFound { path, .. }
            | Self::OperationNotSupported { path, .. }
            | Self::Io { path, .. }
            | Self::Network { path, .. }
            | Self::InvalidMetadata { path, .. } => Some(path),
            Self::DiskNotFound(_) | Self::InvalidConfig(_) | Self::Cancelled => None,
        }
    }
}
