//! Cancellation and deadlines for storage operations.
//!
//! Every storage operation is a future, and dropping it abandons the work at
//! its next suspension point (before or after a disk or network call). These
//! helpers turn an external signal into that drop, resolving to
//! [`Cancelled`](crate::error::ErrorKind::Cancelled) instead of a partial
//! result.
//!
//! ```no_run
//! use depot_storage::{CancellableExt, Storage};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(storage: &Storage) -> depot_storage::error::Result<()> {
//! let token = CancellationToken::new();
//! let data = storage.get("local", "reports/q3.pdf").cancellable(&token).await?;
//! storage.put("s3", "reports/q3.pdf", &data).with_timeout(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ErrorKind, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub trait CancellableExt<T>: Future<Output = Result<T>> + Sized {
    /// Abandon the operation as soon as `token` is cancelled.
    fn cancellable(self, token: &CancellationToken) -> impl Future<Output = Result<T>> {
        async move {
            tokio::select! {
                // Checked first so an already-cancelled token never starts the operation.
                biased;
                () = token.cancelled() => Err(exn::Exn::from(ErrorKind::Cancelled)),
                result = self => result,
            }
        }
    }

    /// Abandon the operation if it hasn't completed within `timeout`.
    fn with_timeout(self, timeout: Duration) -> impl Future<Output = Result<T>> {
        async move {
            match tokio::time::timeout(timeout, self).await {
                Ok(result) => result,
                Err(_elapsed) => Err(exn::Exn::from(ErrorKind::Cancelled)),
            }
        }
    }
}

impl<T, F> CancellableExt<T> for F where F: Future<Output = Result<T>> {}
