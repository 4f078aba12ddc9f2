//! Remote store operations trait.
//!
//! This is the seam between the worker/router engine and the object
//! store. Transfers go through local files so large objects never have
//! to sit in memory.

use async_trait::async_trait;
use std::path::Path;

use super::RemoteResult;
use super::types::{ObjectAttr, ObjectPath, RemoteEntry};

/// Object-store operations used by the backend.
///
/// All calls may block on the network. Callers retry at most once on a
/// transient error (see [`retry_once`](super::retry_once)).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Download `path` into the local file `dest`, replacing its contents.
    ///
    /// Returns the number of bytes written.
    async fn fetch(&self, path: &ObjectPath, dest: &Path) -> RemoteResult<u64>;

    /// Upload the local file `src` as object `path`.
    async fn store(&self, src: &Path, path: &ObjectPath) -> RemoteResult<()>;

    /// Delete object `path`. Missing objects report `NotFound`.
    async fn remove(&self, path: &ObjectPath) -> RemoteResult<()>;

    /// Remove the (empty) directory `path`.
    ///
    /// The caller checks emptiness first; backends only drop the marker.
    async fn remove_dir(&self, path: &ObjectPath) -> RemoteResult<()>;

    /// List the immediate children of directory `prefix`.
    ///
    /// Entries are sorted by name.
    async fn list(&self, prefix: &ObjectPath) -> RemoteResult<Vec<RemoteEntry>>;

    /// Attributes of a single object or directory.
    async fn head(&self, path: &ObjectPath) -> RemoteResult<ObjectAttr>;

    /// Create a directory marker at `path`.
    async fn create_dir(&self, path: &ObjectPath) -> RemoteResult<()>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
