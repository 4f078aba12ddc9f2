//! Remote object store abstraction.
//!
//! - [`RemoteStore`] - Core trait for object operations
//! - [`S3Store`] - MinIO / S3-compatible backend
//! - [`LocalDirStore`] - Directory-backed store for development
//! - [`MemoryStore`] - In-memory store with call counters (for tests)
//!
//! ## Design Decisions
//!
//! - **Keys, not paths**: every call takes an [`ObjectPath`], already
//!   normalized, so backends never see a leading slash or `..`.
//! - **File-based transfers**: `fetch` and `store` stream between the
//!   bucket and a local staging file.
//! - **Retry once**: transient errors are retried a single time by the
//!   caller via [`retry_once`]; `NotFound` never is.

pub mod backends;
mod error;
mod ops;
mod types;

use std::future::Future;
use std::time::Duration;
use tracing::Instrument;

pub use backends::{LocalDirStore, MemoryStore, S3Config, S3Store, StoreOp};
pub use error::{RemoteError, RemoteResult};
pub use ops::RemoteStore;
pub use types::{ObjectAttr, ObjectKind, ObjectPath, RemoteEntry};

/// Pause before the single retry of a transient failure.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run a remote operation, retrying once if the first attempt fails with a
/// transient error.
pub async fn retry_once<T, F, Fut>(op: &'static str, path: &ObjectPath, mut call: F) -> RemoteResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let span = tracing::debug_span!("remote.call", op, path = %path);
    async {
        match call().await {
            Err(e) if e.is_transient() => {
                tracing::debug!(error = %e, "transient remote error, retrying once");
                tokio::time::sleep(RETRY_DELAY).await;
                call().await
            }
            other => other,
        }
    }
    .instrument(span)
    .await
}
