//! Storage models.
//!
//! These types are what backends hand back to callers: listing entries and
//! the caller-defined metadata recorded alongside content.

use std::collections::HashMap;
use time::OffsetDateTime;

/// Caller-defined metadata recorded alongside a piece of content.
///
/// Only `content_type` and `custom_headers` are persisted by backends; `size`
/// and `last_modified` are filled in from the content itself when metadata is
/// read back, and ignored when it is written.
///
/// Metadata is always replaced wholesale; old and new custom headers are
/// never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub content_type: String,
    /// Size of the described content in bytes.
    pub size: u64,
    pub last_modified: Option<OffsetDateTime>,
    pub custom_headers: HashMap<String, String>,
}
impl Metadata {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }
}

/// A single entry returned by a listing operation.
///
/// An immutable snapshot taken at list time; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Relative, forward-slash path from the backend root
    pub path: String,
    /// Content size in bytes (always `0` for directories)
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
    /// Container entry (a directory, or a key prefix on object storage)
    pub is_dir: bool,
    /// Metadata recorded for this entry, when the backend can supply it cheaply
    pub metadata: Option<Metadata>,
}
impl FileInfo {
    /// Create a new FileInfo for a piece of content.
    pub fn file(path: impl Into<String>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
            is_dir: false,
            metadata: None,
        }
    }

    /// Create a new FileInfo for a container entry.
    pub fn directory(path: impl Into<String>, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            size: 0,
            modified,
            is_dir: true,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Metadata>) -> Self {
        self.metadata = metadata;
        self
    }
}
