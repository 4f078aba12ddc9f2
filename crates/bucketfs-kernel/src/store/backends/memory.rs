//! In-memory object store.
//!
//! Used for testing. Counts every call per operation and supports
//! injecting failures, so tests can assert exactly how often the engine
//! talks to the bucket.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::error::{RemoteError, RemoteResult};
use crate::store::ops::RemoteStore;
use crate::store::types::{ObjectAttr, ObjectPath, RemoteEntry};

/// Remote operation selector for counters and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumCount)]
#[strum(serialize_all = "snake_case")]
pub enum StoreOp {
    Fetch,
    Store,
    Remove,
    RemoveDir,
    List,
    Head,
    CreateDir,
}

impl StoreOp {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct Contents {
    objects: BTreeMap<String, Vec<u8>>,
    /// Explicit directory markers. Directories also exist implicitly
    /// whenever an object lives under them.
    dirs: BTreeSet<String>,
    faults: HashMap<StoreOp, VecDeque<RemoteError>>,
}

impl Contents {
    fn dir_exists(&self, path: &ObjectPath) -> bool {
        if path.is_root() || self.dirs.contains(path.as_str()) {
            return true;
        }
        let prefix = path.dir_prefix();
        self.objects
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
            || self
                .dirs
                .range(prefix.clone()..)
                .next()
                .is_some_and(|d| d.starts_with(&prefix))
    }
}

/// In-memory object store.
///
/// Thread-safe via an internal mutex. All data is lost when dropped.
#[derive(Debug)]
pub struct MemoryStore {
    contents: Mutex<Contents>,
    calls: [AtomicU64; <StoreOp as strum::EnumCount>::COUNT],
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            contents: Mutex::new(Contents::default()),
            calls: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Seed an object directly, without counting a `store` call.
    ///
    /// # Panics
    ///
    /// Panics if `path` contains a `..` component.
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        let key = ObjectPath::new(path).expect("valid seed path");
        self.contents.lock().objects.insert(key.as_str().to_string(), data.into());
    }

    /// Current contents of an object.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        let key = ObjectPath::new(path).ok()?;
        self.contents.lock().objects.get(key.as_str()).cloned()
    }

    /// Whether an object exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Number of calls made for `op` so far (including failed ones).
    pub fn calls(&self, op: StoreOp) -> u64 {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn fail_next(&self, op: StoreOp, error: RemoteError, times: usize) {
        let mut contents = self.contents.lock();
        let queue = contents.faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Count the call and pop an injected fault, if any.
    fn begin(&self, op: StoreOp) -> RemoteResult<()> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);
        let mut contents = self.contents.lock();
        match contents.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch(&self, path: &ObjectPath, dest: &Path) -> RemoteResult<u64> {
        self.begin(StoreOp::Fetch)?;
        let data = self
            .contents
            .lock()
            .objects
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| RemoteError::not_found(path.as_str()))?;
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn store(&self, src: &Path, path: &ObjectPath) -> RemoteResult<()> {
        self.begin(StoreOp::Store)?;
        let data = tokio::fs::read(src).await?;
        self.contents
            .lock()
            .objects
            .insert(path.as_str().to_string(), data);
        Ok(())
    }

    async fn remove(&self, path: &ObjectPath) -> RemoteResult<()> {
        self.begin(StoreOp::Remove)?;
        match self.contents.lock().objects.remove(path.as_str()) {
            Some(_) => Ok(()),
            None => Err(RemoteError::not_found(path.as_str())),
        }
    }

    async fn remove_dir(&self, path: &ObjectPath) -> RemoteResult<()> {
        self.begin(StoreOp::RemoveDir)?;
        let mut contents = self.contents.lock();
        if contents.dirs.remove(path.as_str()) || contents.dir_exists(path) {
            Ok(())
        } else {
            Err(RemoteError::not_found(path.as_str()))
        }
    }

    async fn list(&self, prefix: &ObjectPath) -> RemoteResult<Vec<RemoteEntry>> {
        self.begin(StoreOp::List)?;
        let contents = self.contents.lock();
        if !contents.dir_exists(prefix) {
            return Err(RemoteError::not_found(prefix.as_str()));
        }

        let base = prefix.dir_prefix();
        let mut children: BTreeMap<String, RemoteEntry> = BTreeMap::new();
        for (key, data) in contents.objects.iter() {
            let Some(rest) = key.strip_prefix(&base) else { continue };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children
                        .entry(dir.to_string())
                        .or_insert_with(|| RemoteEntry::directory(dir));
                }
                None if !rest.is_empty() => {
                    children.insert(rest.to_string(), RemoteEntry::file(rest, data.len() as u64));
                }
                None => {}
            }
        }
        for dir in contents.dirs.iter() {
            let Some(rest) = dir.strip_prefix(&base) else { continue };
            let first = rest.split('/').next().unwrap_or("");
            if !first.is_empty() {
                children
                    .entry(first.to_string())
                    .or_insert_with(|| RemoteEntry::directory(first));
            }
        }
        Ok(children.into_values().collect())
    }

    async fn head(&self, path: &ObjectPath) -> RemoteResult<ObjectAttr> {
        self.begin(StoreOp::Head)?;
        let contents = self.contents.lock();
        if let Some(data) = contents.objects.get(path.as_str()) {
            return Ok(ObjectAttr::file(data.len() as u64));
        }
        if contents.dir_exists(path) {
            return Ok(ObjectAttr::directory());
        }
        Err(RemoteError::not_found(path.as_str()))
    }

    async fn create_dir(&self, path: &ObjectPath) -> RemoteResult<()> {
        self.begin(StoreOp::CreateDir)?;
        self.contents.lock().dirs.insert(path.as_str().to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
