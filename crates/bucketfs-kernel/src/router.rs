//! Object registry and request router.
//!
//! The router owns the path → worker registry and decides, per operation,
//! whether to use a live worker, spawn one, answer from the metadata cache
//! or run a one-shot call against the remote store.
//!
//! ## Design Decisions
//!
//! - **Atomic get-or-create**: the registry is a `DashMap`; its entry API
//!   holds the shard lock only while inserting, never across an `.await`.
//! - **Bounce and re-route**: an operation rejected by a draining worker
//!   waits for that worker to terminate, then goes to a fresh one.
//! - **Guarded removal**: slots are reclaimed only when they still hold the
//!   terminated worker's [`WorkerId`], never a successor.
//! - **Weak sweeper**: the background sweeper holds a `Weak` reference so
//!   dropping the last [`Router`] stops it.
//! - **Drop drains**: dropping the last [`Router`] without
//!   [`Router::shutdown`] detaches the worker tasks instead of aborting
//!   them. Each sees its queue close and runs the shutdown drain, so dirty
//!   caches are still flushed.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RouterConfig;
use crate::error::{FsError, FsResult};
use crate::metadata::{Metadata, MetadataCache, MetadataKind};
use crate::store::{
    ObjectAttr, ObjectKind, ObjectPath, RemoteEntry, RemoteError, RemoteStore, retry_once,
};
use crate::worker::{Op, OpClass, Outcome, WorkerContext, WorkerEvent, WorkerHandle, WorkerId, spawn_worker};

/// Snapshot of router counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Registry slots, including workers that are draining.
    pub workers: usize,
    /// Metadata cache entries, fresh or not.
    pub cached_metadata: usize,
    /// Worker tasks not yet joined.
    pub tasks: usize,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    config: Arc<RouterConfig>,
    workers: DashMap<ObjectPath, WorkerHandle>,
    metadata: Arc<MetadataCache>,
    tasks: Mutex<JoinSet<()>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: CancellationToken,
}

/// Routes file-system operations to workers, caches and the store.
///
/// Cheap to clone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("store", &self.inner.store.name())
            .field("workers", &self.inner.workers.len())
            .finish()
    }
}

impl Router {
    /// Create a router and start its sweeper task.
    pub fn new(store: Arc<dyn RemoteStore>, config: RouterConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let metadata = Arc::new(MetadataCache::new(config.metadata_ttl));
        let sweep_interval = config.sweep_interval;
        let inner = Arc::new(Inner {
            store,
            config: Arc::new(config),
            workers: DashMap::new(),
            metadata,
            tasks: Mutex::new(JoinSet::new()),
            events: events_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(sweep_loop(
            Arc::downgrade(&inner),
            events_rx,
            sweep_interval,
            inner.shutdown.clone(),
        ));

        tracing::info!(store = inner.store.name(), "router started");
        Self { inner }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.inner.metadata
    }

    /// Execute `op` on `path`.
    #[tracing::instrument(skip_all, name = "route.execute", fields(path = %path, op = op.name()))]
    pub async fn execute(&self, path: &ObjectPath, op: Op) -> FsResult<Outcome> {
        match op.class() {
            OpClass::Stateful => self.dispatch(path, op).await,
            OpClass::Metadata => self.metadata_op(path, op).await,
            OpClass::Namespace => self.namespace_op(path, op).await,
        }
    }

    // ========================================================================
    // Typed front end
    // ========================================================================

    pub async fn read(&self, path: &ObjectPath, size: u64, offset: u64) -> FsResult<Vec<u8>> {
        match self.execute(path, Op::Read { size, offset }).await? {
            Outcome::Data(data) => Ok(data),
            other => Err(unexpected("read", other)),
        }
    }

    pub async fn write(&self, path: &ObjectPath, data: Vec<u8>, offset: u64) -> FsResult<u64> {
        match self.execute(path, Op::Write { data, offset }).await? {
            Outcome::Written(n) => Ok(n),
            other => Err(unexpected("write", other)),
        }
    }

    pub async fn create(&self, path: &ObjectPath) -> FsResult<()> {
        self.execute(path, Op::Create).await.map(drop)
    }

    /// Flush pending writes. Returns whether anything was uploaded.
    pub async fn flush(&self, path: &ObjectPath) -> FsResult<bool> {
        match self.execute(path, Op::Flush).await? {
            Outcome::Flushed(uploaded) => Ok(uploaded),
            other => Err(unexpected("flush", other)),
        }
    }

    pub async fn truncate(&self, path: &ObjectPath, length: u64) -> FsResult<()> {
        self.execute(path, Op::Truncate { length }).await.map(drop)
    }

    pub async fn release(&self, path: &ObjectPath) -> FsResult<()> {
        self.execute(path, Op::Release).await.map(drop)
    }

    pub async fn unlink(&self, path: &ObjectPath) -> FsResult<()> {
        self.execute(path, Op::Unlink).await.map(drop)
    }

    pub async fn access(&self, path: &ObjectPath) -> FsResult<ObjectAttr> {
        match self.execute(path, Op::Stat).await? {
            Outcome::Attr(attr) => Ok(attr),
            other => Err(unexpected("access", other)),
        }
    }

    pub async fn list_dir(&self, path: &ObjectPath) -> FsResult<Vec<RemoteEntry>> {
        match self.execute(path, Op::ListDir).await? {
            Outcome::Listing(entries) => Ok(entries),
            other => Err(unexpected("list_dir", other)),
        }
    }

    pub async fn mkdir(&self, path: &ObjectPath) -> FsResult<()> {
        self.execute(path, Op::Mkdir).await.map(drop)
    }

    pub async fn rmdir(&self, path: &ObjectPath) -> FsResult<()> {
        self.execute(path, Op::Rmdir).await.map(drop)
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Whether `path` has a live (not yet terminated) worker.
    pub fn has_worker(&self, path: &ObjectPath) -> bool {
        self.live_worker(path).is_some()
    }

    /// Handle of the live worker for `path`, if any.
    pub fn worker(&self, path: &ObjectPath) -> Option<WorkerHandle> {
        self.live_worker(path)
    }

    fn live_worker(&self, path: &ObjectPath) -> Option<WorkerHandle> {
        let handle = self.inner.workers.get(path).map(|h| h.clone())?;
        if handle.is_terminated() {
            self.inner.reap(path, handle.id());
            None
        } else {
            Some(handle)
        }
    }

    fn get_or_spawn(&self, path: &ObjectPath) -> FsResult<WorkerHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(FsError::WorkerGone);
        }
        let handle = match self.inner.workers.entry(path.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_terminated() {
                    let handle = self.inner.spawn(path);
                    slot.insert(handle.clone());
                    handle
                } else {
                    slot.get().clone()
                }
            }
            Entry::Vacant(slot) => {
                let handle = self.inner.spawn(path);
                slot.insert(handle.clone());
                handle
            }
        };
        Ok(handle)
    }

    /// Wait out a draining worker and drop its slot.
    async fn await_successor(&self, path: &ObjectPath, old: &WorkerHandle) {
        tracing::debug!(%path, worker = %old.id(), "op bounced by draining worker, rerouting");
        old.terminated().await;
        self.inner.reap(path, old.id());
    }

    async fn dispatch(&self, path: &ObjectPath, mut op: Op) -> FsResult<Outcome> {
        // The root is a directory, never an object.
        if path.is_root() {
            return Err(FsError::is_a_directory("/"));
        }
        loop {
            let handle = self.get_or_spawn(path)?;
            match handle.submit(op).await {
                Ok(result) => return result,
                Err(bounced) => {
                    op = bounced;
                    self.await_successor(path, &handle).await;
                }
            }
        }
    }

    /// Run `op` on the live worker for `path` if there is one.
    ///
    /// Returns the op back when no worker took it.
    async fn try_live(&self, path: &ObjectPath, mut op: Op) -> Result<FsResult<Outcome>, Op> {
        while let Some(handle) = self.live_worker(path) {
            match handle.submit(op).await {
                Ok(result) => return Ok(result),
                Err(bounced) => {
                    op = bounced;
                    self.await_successor(path, &handle).await;
                }
            }
        }
        Err(op)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    async fn metadata_op(&self, path: &ObjectPath, op: Op) -> FsResult<Outcome> {
        let op = match self.try_live(path, op).await {
            Ok(result) => return result,
            Err(op) => op,
        };
        match op {
            Op::ListDir => {
                let entries = self.cached_listing(path).await?;
                Ok(Outcome::Listing(self.overlay_live(path, entries).await))
            }
            _ => self.cached_stat(path).await.map(Outcome::Attr),
        }
    }

    async fn cached_stat(&self, path: &ObjectPath) -> FsResult<ObjectAttr> {
        if path.is_root() {
            return Ok(ObjectAttr::directory());
        }
        match self.inner.metadata.get_fresh(path, MetadataKind::Stat) {
            Some(Metadata::Attr(attr)) => return Ok(attr),
            Some(Metadata::Missing) => return Err(FsError::not_found(path.as_str())),
            _ => {}
        }

        let store = &self.inner.store;
        match retry_once("head", path, || store.head(path)).await {
            Ok(attr) => {
                self.inner.metadata.put_attr(path, attr.clone());
                Ok(attr)
            }
            Err(RemoteError::NotFound(_)) => {
                self.inner.metadata.put_missing(path);
                Err(FsError::not_found(path.as_str()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cached_listing(&self, path: &ObjectPath) -> FsResult<Vec<RemoteEntry>> {
        if let Some(Metadata::Listing(entries)) = self.inner.metadata.get_fresh(path, MetadataKind::Listing) {
            return Ok(entries);
        }
        if let Some(Metadata::Missing) = self.inner.metadata.get_fresh(path, MetadataKind::Stat) {
            return Err(FsError::not_found(path.as_str()));
        }

        let store = &self.inner.store;
        let entries = retry_once("list", path, || store.list(path)).await?;
        // A listing is usually followed by a stat of every entry.
        for entry in &entries {
            if let Ok(child) = path.join(&entry.name) {
                let attr = match entry.kind {
                    ObjectKind::File => ObjectAttr::file(entry.size),
                    ObjectKind::Directory => ObjectAttr::directory(),
                };
                self.inner.metadata.put_attr(&child, attr);
            }
        }
        self.inner
            .metadata
            .insert(path.clone(), MetadataKind::Listing, Metadata::Listing(entries.clone()));
        Ok(entries)
    }

    /// Replace listing entries with the state of live child workers.
    async fn overlay_live(&self, dir: &ObjectPath, mut entries: Vec<RemoteEntry>) -> Vec<RemoteEntry> {
        let children: Vec<WorkerHandle> = self
            .inner
            .workers
            .iter()
            .filter(|slot| !slot.key().is_root() && slot.key().parent() == *dir)
            .map(|slot| slot.value().clone())
            .filter(|handle| !handle.is_terminated())
            .collect();

        for child in children {
            let attr = match child.submit(Op::Stat).await {
                Ok(Ok(Outcome::Attr(attr))) => attr,
                // Not materialized and absent remotely, or gone meanwhile.
                _ => continue,
            };
            let name = child.path().name();
            match entries.iter_mut().find(|e| e.name == name) {
                Some(entry) => {
                    entry.kind = attr.kind;
                    entry.size = attr.size;
                }
                None => entries.push(RemoteEntry::file(name, attr.size)),
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    async fn namespace_op(&self, path: &ObjectPath, op: Op) -> FsResult<Outcome> {
        let op = match self.try_live(path, op).await {
            Ok(result) => return result,
            Err(op) => op,
        };
        let result = match op {
            Op::Mkdir => self.mkdir_remote(path).await,
            Op::Rmdir => self.rmdir_remote(path).await,
            _ => self.unlink_remote(path).await,
        };
        result.map(|()| Outcome::Done)
    }

    async fn unlink_remote(&self, path: &ObjectPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::permission_denied("/"));
        }
        // Never retried.
        let removed = self.inner.store.remove(path).await;
        self.inner.metadata.invalidate_with_parent(path);
        removed?;
        self.inner.metadata.put_missing(path);
        Ok(())
    }

    async fn mkdir_remote(&self, path: &ObjectPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::already_exists("/"));
        }
        match self.cached_stat(path).await {
            Ok(_) => return Err(FsError::already_exists(path.as_str())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let store = &self.inner.store;
        retry_once("create_dir", path, || store.create_dir(path)).await?;
        self.inner.metadata.invalidate_with_parent(path);
        self.inner.metadata.put_attr(path, ObjectAttr::directory());
        Ok(())
    }

    async fn rmdir_remote(&self, path: &ObjectPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::permission_denied("/"));
        }

        let store = &self.inner.store;
        let attr = retry_once("head", path, || store.head(path)).await?;
        if attr.kind.is_file() {
            return Err(FsError::not_a_directory(path.as_str()));
        }
        let has_live_child = self
            .inner
            .workers
            .iter()
            .any(|slot| slot.key().parent() == *path && !slot.value().is_terminated());
        let entries = retry_once("list", path, || store.list(path)).await?;
        if has_live_child || !entries.is_empty() {
            return Err(FsError::directory_not_empty(path.as_str()));
        }

        retry_once("remove_dir", path, || store.remove_dir(path)).await?;
        self.inner.metadata.invalidate_with_parent(path);
        self.inner.metadata.put_missing(path);
        Ok(())
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            workers: self.inner.workers.len(),
            cached_metadata: self.inner.metadata.len(),
            tasks: self.inner.tasks.lock().len(),
        }
    }

    /// Run one sweep now: reap terminated workers, join finished tasks,
    /// evict expired metadata.
    pub fn sweep(&self) {
        self.inner.sweep();
    }

    /// Drain every worker and wait for their tasks.
    ///
    /// New stateful operations fail with [`FsError::WorkerGone`] afterwards.
    pub async fn shutdown(&self) {
        tracing::info!(workers = self.inner.workers.len(), "router shutting down");
        self.inner.shutdown.cancel();
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker task failed");
            }
        }
        self.inner.workers.clear();
        tracing::info!("router shut down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping a JoinSet aborts its tasks mid-session.
        let tasks = self.tasks.get_mut();
        if !tasks.is_empty() {
            tracing::debug!(tasks = tasks.len(), "router dropped, workers drain on their own");
            tasks.detach_all();
        }
        self.shutdown.cancel();
    }
}

impl Inner {
    fn spawn(&self, path: &ObjectPath) -> WorkerHandle {
        let ctx = WorkerContext {
            store: self.store.clone(),
            metadata: self.metadata.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
        };
        let (handle, task) = spawn_worker(path.clone(), ctx);
        self.tasks.lock().spawn(task);
        tracing::debug!(%path, worker = %handle.id(), "worker spawned");
        handle
    }

    /// Drop the slot for `path` if it still holds worker `id` and that
    /// worker has terminated.
    fn reap(&self, path: &ObjectPath, id: WorkerId) {
        self.workers
            .remove_if(path, |_, handle| handle.id() == id && handle.is_terminated());
    }

    fn sweep(&self) {
        self.workers.retain(|_, handle| !handle.is_terminated());

        let mut tasks = self.tasks.lock();
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker task failed");
            }
        }
        drop(tasks);

        let evicted = self.metadata.evict_expired();
        if evicted > 0 {
            tracing::trace!(evicted, "expired metadata evicted");
        }
    }
}

async fn sweep_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => {
                let (Some(WorkerEvent::Terminated { path, id }), Some(inner)) = (event, inner.upgrade()) else {
                    break;
                };
                inner.reap(&path, id);
            }
            _ = tick.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.sweep();
            }
        }
    }
    tracing::debug!("sweeper stopped");
}

fn unexpected(op: &str, outcome: Outcome) -> FsError {
    FsError::invalid_state(format!("unexpected {op} outcome: {outcome:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};

    fn p(s: &str) -> ObjectPath {
        ObjectPath::new(s).unwrap()
    }

    fn router(store: &Arc<MemoryStore>) -> Router {
        Router::new(store.clone(), RouterConfig::default())
    }

    #[tokio::test]
    async fn test_access_caches_negative_results() {
        let store = Arc::new(MemoryStore::new());
        let r = router(&store);

        assert!(r.access(&p("nope")).await.unwrap_err().is_not_found());
        assert!(r.access(&p("nope")).await.unwrap_err().is_not_found());
        assert_eq!(store.calls(StoreOp::Head), 1);
        assert!(!r.has_worker(&p("nope")));
        r.shutdown().await;
    }

    #[tokio::test]
    async fn test_access_root_is_directory() {
        let store = Arc::new(MemoryStore::new());
        let r = router(&store);
        assert!(r.access(&ObjectPath::root()).await.unwrap().kind.is_dir());
        assert_eq!(store.calls(StoreOp::Head), 0);
        r.shutdown().await;
    }

    #[tokio::test]
    async fn test_mkdir_and_rmdir() {
        let store = Arc::new(MemoryStore::new());
        let r = router(&store);

        r.mkdir(&p("d")).await.unwrap();
        assert!(matches!(r.mkdir(&p("d")).await, Err(FsError::AlreadyExists(_))));
        assert!(r.list_dir(&p("d")).await.unwrap().is_empty());

        store.insert("d/f", b"x".to_vec());
        assert!(matches!(r.rmdir(&p("d")).await, Err(FsError::DirectoryNotEmpty(_))));
        assert!(matches!(r.rmdir(&p("d/f")).await, Err(FsError::NotADirectory(_))));
        assert!(matches!(r.rmdir(&ObjectPath::root()).await, Err(FsError::PermissionDenied(_))));
        r.shutdown().await;
    }

    #[tokio::test]
    async fn test_listing_primes_child_stats() {
        let store = Arc::new(MemoryStore::new());
        store.insert("pics/a.png", vec![0u8; 12]);
        store.insert("pics/raw/b.cr2", b"b".to_vec());
        let r = router(&store);

        r.list_dir(&p("pics")).await.unwrap();
        assert_eq!(r.access(&p("pics/a.png")).await.unwrap().size, 12);
        assert!(r.access(&p("pics/raw")).await.unwrap().kind.is_dir());
        assert_eq!(store.calls(StoreOp::Head), 0);
        r.shutdown().await;
    }

    #[tokio::test]
    async fn test_unlink_without_worker() {
        let store = Arc::new(MemoryStore::new());
        store.insert("x/y", b"1".to_vec());
        let r = router(&store);

        assert_eq!(r.list_dir(&p("x")).await.unwrap().len(), 1);
        r.unlink(&p("x/y")).await.unwrap();
        assert!(!store.contains("x/y"));
        assert!(r.access(&p("x/y")).await.unwrap_err().is_not_found());
        assert!(r.unlink(&p("x/y")).await.unwrap_err().is_not_found());
        assert_eq!(store.calls(StoreOp::Remove), 2);
        r.shutdown().await;
    }

    #[tokio::test]
    async fn test_stateful_ops_on_root_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let r = router(&store);
        let root = ObjectPath::root();

        assert!(matches!(r.create(&root).await, Err(FsError::IsADirectory(_))));
        let err = r.write(&root, b"x".to_vec(), 0).await.unwrap_err();
        assert_eq!(err.status(), -(libc::EISDIR as i8));
        assert!(matches!(r.read(&root, 1, 0).await, Err(FsError::IsADirectory(_))));
        assert!(matches!(r.release(&root).await, Err(FsError::IsADirectory(_))));

        assert_eq!(r.stats().workers, 0);
        assert_eq!(store.calls(StoreOp::Store), 0);
        assert!(!store.contains(""));
        r.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let store = Arc::new(MemoryStore::new());
        let r = router(&store);
        r.create(&p("f")).await.unwrap();
        r.shutdown().await;

        assert_eq!(store.get("f").unwrap(), Vec::<u8>::new());
        assert!(matches!(r.create(&p("g")).await, Err(FsError::WorkerGone)));
        assert_eq!(r.stats().workers, 0);
    }
}
