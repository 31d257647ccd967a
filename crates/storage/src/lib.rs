pub mod backend;
mod cancel;
pub mod error;
mod models;
mod path;
mod storage;

pub use crate::backend::StorageBackend;
pub use crate::cancel::CancellableExt;
pub use crate::models::{FileInfo, Metadata};
pub use crate::path::{PathRejection, validate as validate_path, validate_prefix};
pub use crate::storage::Storage;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
