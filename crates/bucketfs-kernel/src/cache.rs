//! Local cache entry: one path's on-disk staging file.
//!
//! Each entry owns a private scratch directory holding `data.bin`. Reads
//! and writes go to that file; `flush` uploads it as a whole object.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{FsError, FsResult};
use crate::store::{ObjectAttr, ObjectPath, RemoteStore, retry_once};

const DATA_FILE: &str = "data.bin";

/// Cache entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CacheState {
    Uninitialized,
    Materializing,
    Ready,
    Dirty,
    Flushing,
    Closed,
}

/// Staging file for a single remote object.
pub struct LocalCacheEntry {
    path: ObjectPath,
    store: Arc<dyn RemoteStore>,
    scratch_root: Option<PathBuf>,
    state: CacheState,
    dirty: bool,
    /// Removed on drop as a backstop for `discard`.
    scratch: Option<TempDir>,
    file: Option<File>,
}

impl std::fmt::Debug for LocalCacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacheEntry")
            .field("path", &self.path)
            .field("store", &self.store.name())
            .field("state", &self.state)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl LocalCacheEntry {
    pub fn new(path: ObjectPath, store: Arc<dyn RemoteStore>, scratch_root: Option<PathBuf>) -> Self {
        Self {
            path,
            store,
            scratch_root,
            state: CacheState::Uninitialized,
            dirty: false,
            scratch: None,
            file: None,
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the backing file exists and accepts I/O.
    pub fn is_materialized(&self) -> bool {
        matches!(self.state, CacheState::Ready | CacheState::Dirty)
    }

    /// Location of the backing file, once materialized.
    pub fn data_path(&self) -> Option<PathBuf> {
        self.scratch.as_ref().map(|dir| dir.path().join(DATA_FILE))
    }

    /// Create the backing file.
    ///
    /// With `retrieve` the current remote object is downloaded into it;
    /// otherwise it starts empty and dirty. A no-op once materialized.
    pub async fn materialize(&mut self, retrieve: bool) -> FsResult<()> {
        match self.state {
            CacheState::Ready | CacheState::Dirty => return Ok(()),
            CacheState::Uninitialized => {}
            other => {
                return Err(FsError::invalid_state(format!(
                    "cannot materialize {} in state {other}",
                    self.path
                )));
            }
        }

        let scratch = self.make_scratch()?;
        let data_path = scratch.path().join(DATA_FILE);

        if retrieve {
            self.state = CacheState::Materializing;
            let store = Arc::clone(&self.store);
            let path = self.path.clone();
            let fetched = retry_once("fetch", &path, || store.fetch(&path, &data_path)).await;
            match fetched {
                Ok(bytes) => {
                    tracing::debug!(path = %self.path, bytes, "cache materialized from remote");
                }
                Err(e) => {
                    // Dropping `scratch` removes the partial download.
                    self.state = CacheState::Uninitialized;
                    return Err(e.into());
                }
            }
            let file = OpenOptions::new().read(true).write(true).open(&data_path).await?;
            self.file = Some(file);
            self.state = CacheState::Ready;
            self.dirty = false;
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&data_path)
                .await?;
            self.file = Some(file);
            self.state = CacheState::Dirty;
            self.dirty = true;
        }

        self.scratch = Some(scratch);
        Ok(())
    }

    fn make_scratch(&self) -> FsResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bucketfs-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    fn file_mut(&mut self) -> FsResult<&mut File> {
        if !self.is_materialized() {
            return Err(FsError::invalid_state(format!(
                "{} is not open for I/O (state {})",
                self.path, self.state
            )));
        }
        self.file
            .as_mut()
            .ok_or_else(|| FsError::invalid_state(format!("{} has no backing file", self.path)))
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.state = CacheState::Dirty;
    }

    /// Read up to `size` bytes at `offset`. Short past EOF.
    pub async fn read(&mut self, size: u64, offset: u64) -> FsResult<Vec<u8>> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        (&mut *file).take(size).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    pub async fn write(&mut self, data: &[u8], offset: u64) -> FsResult<u64> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        self.mark_dirty();
        Ok(data.len() as u64)
    }

    /// Set the file length.
    pub async fn truncate(&mut self, length: u64) -> FsResult<()> {
        let file = self.file_mut()?;
        file.set_len(length).await?;
        self.mark_dirty();
        Ok(())
    }

    /// Upload the backing file if dirty. Returns whether an upload happened.
    ///
    /// On failure the entry stays dirty so a later flush can retry.
    pub async fn flush(&mut self) -> FsResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let data_path = match self.data_path() {
            Some(p) => p,
            None => return Err(FsError::invalid_state(format!("{} has no backing file", self.path))),
        };

        let file = self.file_mut()?;
        file.flush().await?;
        file.sync_all().await?;

        self.state = CacheState::Flushing;
        let store = Arc::clone(&self.store);
        let path = self.path.clone();
        let result = retry_once("store", &path, || store.store(&data_path, &path)).await;

        match result {
            Ok(()) => {
                self.dirty = false;
                self.state = CacheState::Ready;
                tracing::debug!(path = %self.path, "cache flushed to remote");
                Ok(true)
            }
            Err(e) => {
                self.state = CacheState::Dirty;
                Err(e.into())
            }
        }
    }

    /// Current attributes of the backing file.
    pub async fn attr(&mut self) -> FsResult<ObjectAttr> {
        let meta = self.file_mut()?.metadata().await?;
        Ok(ObjectAttr::file(meta.len()).with_modified(meta.modified().ok()))
    }

    /// Close the file and remove the scratch directory.
    pub fn discard(&mut self) {
        if self.dirty {
            tracing::warn!(path = %self.path, "discarding dirty cache, unflushed data lost");
        }
        self.file = None;
        if let Some(scratch) = self.scratch.take() {
            let dir = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                tracing::debug!(dir = %dir.display(), error = %e, "failed to remove scratch dir");
            }
        }
        self.dirty = false;
        self.state = CacheState::Closed;
    }

    /// Discard after the object was deleted. Pending changes are dropped
    /// on purpose, so no data-loss warning.
    pub fn discard_deleted(&mut self) {
        self.dirty = false;
        self.discard();
    }

    /// Scratch directory, while one exists.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }
}
