//! Local directory store.
//!
//! Mirrors the bucket layout onto a directory tree: objects are files,
//! prefixes are real directories. Useful for running the backend without
//! a MinIO endpoint.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::store::error::{RemoteError, RemoteResult};
use crate::store::ops::RemoteStore;
use crate::store::types::{ObjectAttr, ObjectPath, RemoteEntry};

/// Directory-backed object store.
///
/// All keys resolve under `root`. [`ObjectPath`] rejects `..`, so a key can
/// never escape it.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    /// Create a store rooted at the given directory.
    ///
    /// The root is canonicalized when possible so that logs show real paths.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &ObjectPath) -> PathBuf {
        if path.is_root() {
            self.root.clone()
        } else {
            self.root.join(path.as_str())
        }
    }

    fn not_found_or(e: io::Error, path: &ObjectPath) -> RemoteError {
        if e.kind() == io::ErrorKind::NotFound {
            RemoteError::not_found(path.as_str())
        } else {
            RemoteError::from(e)
        }
    }
}

#[async_trait]
impl RemoteStore for LocalDirStore {
    async fn fetch(&self, path: &ObjectPath, dest: &Path) -> RemoteResult<u64> {
        let src = self.resolve(path);
        let meta = fs::metadata(&src).await.map_err(|e| Self::not_found_or(e, path))?;
        if meta.is_dir() {
            return Err(RemoteError::not_found(path.as_str()));
        }
        // Failures past this point are on the staging side.
        Ok(fs::copy(&src, dest).await?)
    }

    async fn store(&self, src: &Path, path: &ObjectPath) -> RemoteResult<()> {
        let dest = self.resolve(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Copy next to the destination and rename, so readers never see a
        // half-written object.
        let staging = dest.with_file_name(format!(".{}.upload", path.name()));
        fs::copy(src, &staging).await?;
        fs::rename(&staging, &dest).await?;
        Ok(())
    }

    async fn remove(&self, path: &ObjectPath) -> RemoteResult<()> {
        let target = self.resolve(path);
        let meta = fs::metadata(&target).await.map_err(|e| Self::not_found_or(e, path))?;
        if meta.is_dir() {
            return Err(RemoteError::not_found(path.as_str()));
        }
        fs::remove_file(&target).await.map_err(|e| Self::not_found_or(e, path))
    }

    async fn remove_dir(&self, path: &ObjectPath) -> RemoteResult<()> {
        fs::remove_dir(self.resolve(path))
            .await
            .map_err(|e| Self::not_found_or(e, path))
    }

    async fn list(&self, prefix: &ObjectPath) -> RemoteResult<Vec<RemoteEntry>> {
        let dir = self.resolve(prefix);
        let mut entries = Vec::new();
        let mut rd = fs::read_dir(&dir).await.map_err(|e| Self::not_found_or(e, prefix))?;

        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Staging files from in-flight uploads.
            if name.starts_with('.') && name.ends_with(".upload") {
                continue;
            }
            let meta = entry.metadata().await?;
            entries.push(if meta.is_dir() {
                RemoteEntry::directory(name)
            } else {
                RemoteEntry::file(name, meta.len())
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn head(&self, path: &ObjectPath) -> RemoteResult<ObjectAttr> {
        let meta = fs::metadata(self.resolve(path))
            .await
            .map_err(|e| Self::not_found_or(e, path))?;
        let attr = if meta.is_dir() {
            ObjectAttr::directory()
        } else {
            ObjectAttr::file(meta.len())
        };
        Ok(attr.with_modified(meta.modified().ok()))
    }

    async fn create_dir(&self, path: &ObjectPath) -> RemoteResult<()> {
        fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalDirStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(dir.path());
        (dir, store)
    }

    fn p(s: &str) -> ObjectPath {
        ObjectPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_store_then_fetch() {
        let (dir, store) = setup();
        let scratch = TempDir::new().unwrap();
        let src = scratch.path().join("src.bin");
        std::fs::write(&src, b"payload").unwrap();

        store.store(&src, &p("nested/dir/obj.bin")).await.unwrap();
        assert!(dir.path().join("nested/dir/obj.bin").exists());

        let dest = scratch.path().join("dest.bin");
        assert_eq!(store.fetch(&p("nested/dir/obj.bin"), &dest).await.unwrap(), 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let (_dir, store) = setup();
        let scratch = TempDir::new().unwrap();
        let result = store.fetch(&p("missing"), &scratch.path().join("x")).await;
        assert!(matches!(result, Err(RemoteError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_into_missing_scratch_is_io() {
        let (dir, store) = setup();
        std::fs::write(dir.path().join("obj"), b"x").unwrap();
        let scratch = TempDir::new().unwrap();
        let dest = scratch.path().join("gone/data.bin");

        let result = store.fetch(&p("obj"), &dest).await;
        assert!(matches!(result, Err(RemoteError::Io(_))));
    }

    #[tokio::test]
    async fn test_list_and_head() {
        let (dir, store) = setup();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let entries = store.list(&ObjectPath::root()).await.unwrap();
        assert_eq!(
            entries,
            vec![
                RemoteEntry::file("a.txt", 1),
                RemoteEntry::file("b.txt", 2),
                RemoteEntry::directory("sub"),
            ]
        );

        assert_eq!(store.head(&p("b.txt")).await.unwrap().size, 2);
        assert!(store.head(&p("sub")).await.unwrap().kind.is_dir());
    }

    #[tokio::test]
    async fn test_remove_and_remove_dir() {
        let (dir, store) = setup();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();

        store.remove(&p("f")).await.unwrap();
        assert!(matches!(store.remove(&p("f")).await, Err(RemoteError::NotFound(_))));
        // Directories are not removed through `remove`.
        assert!(store.remove(&p("d")).await.is_err());
        store.remove_dir(&p("d")).await.unwrap();
        assert!(!dir.path().join("d").exists());
    }
}
