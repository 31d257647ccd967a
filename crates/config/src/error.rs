//! Config Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The file or environment could not be parsed into a [`Config`](crate::Config).
    #[display("could not load configuration")]
    Load,
    #[display("unsupported configuration format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    #[display("could not determine the configuration directory")]
    NoConfigDirectory,
    /// A disk's backend rejected its settings.
    #[display("could not create disk: {_0}")]
    Disk(#[error(not(source))] String),
    /// The disk's driver was not compiled into this build.
    #[display("disk {disk:?} uses the {driver} driver, which this build does not include")]
    DriverUnavailable { disk: String, driver: &'static str },
}
