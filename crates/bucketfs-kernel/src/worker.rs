//! Per-path object worker.
//!
//! One tokio task owns the [`LocalCacheEntry`] for a path and executes its
//! operations strictly in arrival order. Callers talk to it through a
//! cloneable [`WorkerHandle`]:
//!
//! ```text
//!   WorkerHandle (Clone)      mpsc       ObjectWorker (tokio task)
//!   ┌──────────────────┐  ──────────▶  ┌───────────────────────────┐
//!   │ .submit(op)      │               │ LocalCacheEntry           │
//!   │ .terminated()    │  ◀──────────  │ idle timeout, drain       │
//!   └──────────────────┘   oneshot     │ final metadata report     │
//!          ▲                           └───────────────────────────┘
//!          └──── watch<Lifecycle> ──────────────┘
//! ```
//!
//! Once a worker starts draining it closes its queue. Operations that were
//! already queued behind a terminal operation come back to the caller as
//! [`Delivery::Bounced`], so the router can re-route them to a successor.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cache::LocalCacheEntry;
use crate::config::RouterConfig;
use crate::error::{FsError, FsResult};
use crate::metadata::{MetadataCache, MetadataKind};
use crate::store::{ObjectAttr, ObjectPath, RemoteEntry, RemoteError, RemoteStore, retry_once};

// ============================================================================
// Operations
// ============================================================================

/// A file-system operation on one path.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Op {
    Read { size: u64, offset: u64 },
    Write { data: Vec<u8>, offset: u64 },
    Create,
    Flush,
    Truncate { length: u64 },
    Release,
    Unlink,
    Stat,
    ListDir,
    Mkdir,
    Rmdir,
}

/// How the router handles an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Needs the path's worker; one is created on demand.
    Stateful,
    /// Served by a live worker, the metadata cache or a one-shot lookup.
    Metadata,
    /// Served by a live worker or directly against the store.
    Namespace,
}

impl Op {
    /// Short name for logs and spans.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn class(&self) -> OpClass {
        match self {
            Op::Read { .. }
            | Op::Write { .. }
            | Op::Create
            | Op::Flush
            | Op::Truncate { .. }
            | Op::Release => OpClass::Stateful,
            Op::Stat | Op::ListDir => OpClass::Metadata,
            Op::Unlink | Op::Mkdir | Op::Rmdir => OpClass::Namespace,
        }
    }

    /// Drain reason if this operation ends the worker's session.
    fn terminal_reason(&self) -> Option<DrainReason> {
        match self {
            Op::Release => Some(DrainReason::Release),
            Op::Unlink => Some(DrainReason::Unlink),
            _ => None,
        }
    }
}

/// Successful result of an [`Op`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Data(Vec<u8>),
    Written(u64),
    /// Whether a flush uploaded anything.
    Flushed(bool),
    Attr(ObjectAttr),
    Listing(Vec<RemoteEntry>),
}

/// What a worker sends back for a submitted operation.
#[derive(Debug)]
pub enum Delivery {
    Done(FsResult<Outcome>),
    /// Not executed: the worker was draining. Re-route it.
    Bounced(Op),
}

struct Envelope {
    op: Op,
    reply: oneshot::Sender<Delivery>,
}

// ============================================================================
// Identity and lifecycle
// ============================================================================

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic worker identity. Distinguishes successive workers of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Worker lifecycle, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Lifecycle {
    Starting,
    Running,
    Draining,
    Terminated,
}

/// Why a worker is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DrainReason {
    Idle,
    Release,
    Unlink,
    Shutdown,
}

impl DrainReason {
    /// Release and unlink end the session; later queued ops go to a successor.
    fn ends_session(self) -> bool {
        matches!(self, DrainReason::Release | DrainReason::Unlink)
    }
}

/// Notification from a worker to the router's sweeper.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Terminated { path: ObjectPath, id: WorkerId },
}

#[derive(Debug)]
struct WorkerStats {
    pending: AtomicU64,
    completed: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn received(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        *self.last_activity.lock() = Instant::now();
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    path: ObjectPath,
    tx: mpsc::UnboundedSender<Envelope>,
    lifecycle: watch::Receiver<Lifecycle>,
    stats: Arc<WorkerStats>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope").field("op", &self.op.name()).finish()
    }
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.lifecycle() == Lifecycle::Terminated
    }

    /// Operations submitted but not yet picked up.
    pub fn pending(&self) -> u64 {
        self.stats.pending.load(Ordering::SeqCst)
    }

    /// Operations executed so far.
    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::SeqCst)
    }

    pub fn last_activity(&self) -> Instant {
        *self.stats.last_activity.lock()
    }

    /// Queue `op` and wait for its result.
    ///
    /// Returns `Err(op)` when the worker is draining and did not run it.
    pub async fn submit(&self, op: Op) -> Result<FsResult<Outcome>, Op> {
        let (reply, rx) = oneshot::channel();
        self.stats.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(envelope)) = self.tx.send(Envelope { op, reply }) {
            self.stats.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(envelope.op);
        }
        match rx.await {
            Ok(Delivery::Done(result)) => Ok(result),
            Ok(Delivery::Bounced(op)) => Err(op),
            Err(_) => Ok(Err(FsError::WorkerGone)),
        }
    }

    /// Resolve once the worker has published `Terminated`.
    pub async fn terminated(&self) {
        let mut rx = self.lifecycle.clone();
        // A dropped sender means the task is gone, which is just as final.
        let _ = rx.wait_for(|state| *state == Lifecycle::Terminated).await;
    }
}

// ============================================================================
// Worker task
// ============================================================================

/// Shared resources every worker needs.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn RemoteStore>,
    pub metadata: Arc<MetadataCache>,
    pub config: Arc<RouterConfig>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub shutdown: CancellationToken,
}

/// Metadata to publish when the worker goes away.
enum FinalReport {
    Attr(ObjectAttr),
    Invalidate,
    Nothing,
}

struct ObjectWorker {
    id: WorkerId,
    path: ObjectPath,
    cache: LocalCacheEntry,
    ctx: WorkerContext,
    rx: mpsc::UnboundedReceiver<Envelope>,
    lifecycle: watch::Sender<Lifecycle>,
    stats: Arc<WorkerStats>,
    /// Set once a read has been served; cleared by release.
    read_open: bool,
}

/// Create a worker for `path` and return its handle plus the task future.
pub(crate) fn spawn_worker(
    path: ObjectPath,
    ctx: WorkerContext,
) -> (WorkerHandle, impl std::future::Future<Output = ()> + Send + 'static) {
    let id = WorkerId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Starting);
    let stats = Arc::new(WorkerStats::new());

    let handle = WorkerHandle {
        id,
        path: path.clone(),
        tx,
        lifecycle: lifecycle_rx,
        stats: stats.clone(),
    };

    let cache = LocalCacheEntry::new(
        path.clone(),
        ctx.store.clone(),
        ctx.config.scratch_dir.clone(),
    );
    let span = tracing::info_span!("worker.session", path = %path, worker = %id);
    let worker = ObjectWorker {
        id,
        path,
        cache,
        ctx,
        rx,
        lifecycle: lifecycle_tx,
        stats,
        read_open: false,
    };

    (handle, worker.run().instrument(span))
}

impl ObjectWorker {
    fn set_lifecycle(&self, state: Lifecycle) {
        self.lifecycle.send_replace(state);
    }

    async fn run(mut self) {
        self.set_lifecycle(Lifecycle::Running);
        tracing::debug!("worker started");

        let shutdown = self.ctx.shutdown.clone();
        let reason = loop {
            let idle = self.ctx.config.idle_timeout(self.read_open);
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break DrainReason::Shutdown,
                next = tokio::time::timeout(idle, self.rx.recv()) => next,
            };
            match next {
                Ok(Some(envelope)) => {
                    if let Some(reason) = self.handle(envelope).await {
                        break reason;
                    }
                }
                // Every handle dropped: the router is gone.
                Ok(None) => break DrainReason::Shutdown,
                Err(_) => break DrainReason::Idle,
            }
        };

        self.drain(reason).await;
    }

    /// Execute one envelope. Returns a drain reason for terminal ops.
    async fn handle(&mut self, envelope: Envelope) -> Option<DrainReason> {
        self.stats.received();
        let Envelope { op, reply } = envelope;
        let terminal = op.terminal_reason();
        let name = op.name();

        let result = self.execute(op).await;
        self.stats.completed.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = &result {
            tracing::debug!(op = name, kind = e.kind(), error = %e, "worker op failed");
        }
        // The caller may have given up; nothing to do then.
        let _ = reply.send(Delivery::Done(result));
        terminal
    }

    async fn execute(&mut self, op: Op) -> FsResult<Outcome> {
        match op {
            Op::Read { size, offset } => {
                self.cache.materialize(true).await?;
                let data = self.cache.read(size, offset).await?;
                self.read_open = true;
                Ok(Outcome::Data(data))
            }
            Op::Write { data, offset } => {
                self.cache.materialize(true).await?;
                let written = self.cache.write(&data, offset).await?;
                Ok(Outcome::Written(written))
            }
            Op::Create => {
                if self.cache.is_materialized() {
                    self.cache.truncate(0).await?;
                } else {
                    self.cache.materialize(false).await?;
                }
                Ok(Outcome::Done)
            }
            Op::Truncate { length } => {
                self.cache.materialize(length > 0).await?;
                self.cache.truncate(length).await?;
                Ok(Outcome::Done)
            }
            Op::Flush => {
                let uploaded = self.cache.flush().await?;
                if uploaded {
                    self.publish_attr().await;
                }
                Ok(Outcome::Flushed(uploaded))
            }
            Op::Release => {
                self.read_open = false;
                let uploaded = self.cache.flush().await?;
                Ok(Outcome::Flushed(uploaded))
            }
            Op::Unlink => self.unlink().await,
            Op::Stat => {
                if self.cache.is_materialized() {
                    Ok(Outcome::Attr(self.cache.attr().await?))
                } else {
                    let store = &self.ctx.store;
                    let path = &self.path;
                    let attr = retry_once("head", path, || store.head(path)).await?;
                    Ok(Outcome::Attr(attr))
                }
            }
            Op::ListDir | Op::Rmdir => Err(FsError::not_a_directory(self.path.as_str())),
            Op::Mkdir => Err(FsError::already_exists(self.path.as_str())),
        }
    }

    async fn unlink(&mut self) -> FsResult<Outcome> {
        let local = self.cache.is_materialized();
        // Never retried.
        let removed = self.ctx.store.remove(&self.path).await;
        self.cache.discard_deleted();

        match removed {
            Ok(()) => {}
            // Created here and never uploaded.
            Err(RemoteError::NotFound(_)) if local => {}
            Err(e) => {
                self.ctx.metadata.invalidate_with_parent(&self.path);
                return Err(e.into());
            }
        }
        self.ctx.metadata.put_missing(&self.path);
        self.ctx
            .metadata
            .invalidate(&self.path.parent(), MetadataKind::Listing);
        Ok(Outcome::Done)
    }

    /// Push the cache's current attributes after an upload.
    async fn publish_attr(&mut self) {
        match self.cache.attr().await {
            Ok(attr) => {
                self.ctx.metadata.put_attr(&self.path, attr);
                self.ctx
                    .metadata
                    .invalidate(&self.path.parent(), MetadataKind::Listing);
            }
            Err(e) => {
                tracing::debug!(error = %e, "could not read cache attributes");
                self.ctx.metadata.invalidate_with_parent(&self.path);
            }
        }
    }

    async fn final_report(&mut self) -> FinalReport {
        if !self.cache.is_materialized() {
            return FinalReport::Nothing;
        }
        if self.cache.is_dirty() {
            return FinalReport::Invalidate;
        }
        match self.cache.attr().await {
            Ok(attr) => FinalReport::Attr(attr),
            Err(_) => FinalReport::Invalidate,
        }
    }

    async fn drain(mut self, mut reason: DrainReason) {
        self.set_lifecycle(Lifecycle::Draining);
        self.rx.close();

        // Ops accepted before the close still get an answer.
        while let Some(envelope) = self.rx.recv().await {
            if reason.ends_session() {
                self.stats.received();
                let _ = envelope.reply.send(Delivery::Bounced(envelope.op));
                continue;
            }
            if let Some(terminal) = self.handle(envelope).await {
                reason = terminal;
            }
        }

        if !reason.ends_session() && self.cache.is_dirty() {
            if let Err(e) = self.cache.flush().await {
                tracing::error!(%reason, kind = e.kind(), error = %e, "final flush failed");
            }
        }

        let report = self.final_report().await;
        self.cache.discard();
        match report {
            FinalReport::Attr(attr) => {
                self.ctx.metadata.put_attr(&self.path, attr);
                self.ctx
                    .metadata
                    .invalidate(&self.path.parent(), MetadataKind::Listing);
            }
            FinalReport::Invalidate => self.ctx.metadata.invalidate_with_parent(&self.path),
            FinalReport::Nothing => {}
        }

        self.set_lifecycle(Lifecycle::Terminated);
        let _ = self.ctx.events.send(WorkerEvent::Terminated {
            path: self.path.clone(),
            id: self.id,
        });

        let completed = self.stats.completed.load(Ordering::SeqCst);
        if reason == DrainReason::Idle {
            tracing::info!(completed, "worker idle-closed");
        } else {
            tracing::debug!(%reason, completed, "worker terminated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::store::{MemoryStore, StoreOp};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        metadata: Arc<MetadataCache>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        ctx: WorkerContext,
    }

    fn fixture(config: RouterConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let metadata = Arc::new(MetadataCache::new(Duration::from_secs(60)));
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            store: store.clone(),
            metadata: metadata.clone(),
            config: Arc::new(config),
            events: events_tx,
            shutdown: CancellationToken::new(),
        };
        Fixture {
            store,
            metadata,
            events,
            ctx,
        }
    }

    fn start(fx: &Fixture, path: &str) -> WorkerHandle {
        let (handle, task) = spawn_worker(ObjectPath::new(path).unwrap(), fx.ctx.clone());
        tokio::spawn(task);
        handle
    }

    async fn run(handle: &WorkerHandle, op: Op) -> FsResult<Outcome> {
        handle.submit(op).await.expect("worker should not bounce")
    }

    #[tokio::test]
    async fn test_create_write_read_release() {
        let mut fx = fixture(RouterConfig::default());
        let w = start(&fx, "a/b.txt");

        run(&w, Op::Create).await.unwrap();
        assert_eq!(
            run(&w, Op::Write { data: b"hello".to_vec(), offset: 0 }).await.unwrap(),
            Outcome::Written(5)
        );
        assert_eq!(
            run(&w, Op::Read { size: 5, offset: 0 }).await.unwrap(),
            Outcome::Data(b"hello".to_vec())
        );
        assert_eq!(run(&w, Op::Release).await.unwrap(), Outcome::Flushed(true));

        w.terminated().await;
        assert_eq!(fx.store.get("a/b.txt").unwrap(), b"hello");
        assert_eq!(fx.store.calls(StoreOp::Fetch), 0);
        assert!(matches!(fx.events.recv().await, Some(WorkerEvent::Terminated { id, .. }) if id == w.id()));
        assert_eq!(w.completed(), 4);
    }

    #[tokio::test]
    async fn test_ops_after_release_bounce() {
        let fx = fixture(RouterConfig::default());
        let w = start(&fx, "f");
        run(&w, Op::Create).await.unwrap();
        run(&w, Op::Release).await.unwrap();
        w.terminated().await;

        assert_eq!(w.submit(Op::Flush).await.unwrap_err(), Op::Flush);
        assert_eq!(w.pending(), 0);
    }

    #[tokio::test]
    async fn test_truncate_zero_never_fetches() {
        let fx = fixture(RouterConfig::default());
        fx.store.insert("big", vec![7u8; 64]);
        let w = start(&fx, "big");

        run(&w, Op::Truncate { length: 0 }).await.unwrap();
        assert_eq!(fx.store.calls(StoreOp::Fetch), 0);
        run(&w, Op::Flush).await.unwrap();
        assert_eq!(fx.store.get("big").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_stat_prefers_local_state() {
        let fx = fixture(RouterConfig::default());
        fx.store.insert("s", b"abc".to_vec());
        let w = start(&fx, "s");

        assert_eq!(run(&w, Op::Stat).await.unwrap(), Outcome::Attr(ObjectAttr::file(3)));
        run(&w, Op::Write { data: b"defgh".to_vec(), offset: 3 }).await.unwrap();
        let Outcome::Attr(attr) = run(&w, Op::Stat).await.unwrap() else {
            panic!("expected attr");
        };
        assert_eq!(attr.size, 8);
    }

    #[tokio::test]
    async fn test_namespace_ops_on_open_file() {
        let fx = fixture(RouterConfig::default());
        let w = start(&fx, "file");
        run(&w, Op::Create).await.unwrap();
        assert!(matches!(run(&w, Op::Mkdir).await, Err(FsError::AlreadyExists(_))));
        assert!(matches!(run(&w, Op::Rmdir).await, Err(FsError::NotADirectory(_))));
        assert!(matches!(run(&w, Op::ListDir).await, Err(FsError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn test_unlink_skips_flush_and_records_missing() {
        let fx = fixture(RouterConfig::default());
        fx.store.insert("doomed", b"old".to_vec());
        let w = start(&fx, "doomed");
        run(&w, Op::Write { data: b"new".to_vec(), offset: 0 }).await.unwrap();

        run(&w, Op::Unlink).await.unwrap();
        w.terminated().await;
        assert!(!fx.store.contains("doomed"));
        assert_eq!(fx.store.calls(StoreOp::Store), 0);
        assert_eq!(
            fx.metadata.get_fresh(&ObjectPath::new("doomed").unwrap(), MetadataKind::Stat),
            Some(Metadata::Missing)
        );
    }

    #[tokio::test]
    async fn test_idle_drain_flushes_dirty_cache() {
        let config = RouterConfig::default()
            .with_timeouts(Duration::from_millis(50), Duration::from_millis(200));
        let fx = fixture(config);
        let w = start(&fx, "idle.txt");
        run(&w, Op::Create).await.unwrap();
        run(&w, Op::Write { data: b"late".to_vec(), offset: 0 }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), w.terminated())
            .await
            .expect("worker should idle-close");
        assert_eq!(fx.store.get("idle.txt").unwrap(), b"late");
        let cached = fx
            .metadata
            .get_fresh(&ObjectPath::new("idle.txt").unwrap(), MetadataKind::Stat);
        assert!(matches!(cached, Some(Metadata::Attr(attr)) if attr.size == 4));
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let fx = fixture(RouterConfig::default());
        let w = start(&fx, "s.txt");
        run(&w, Op::Create).await.unwrap();
        fx.ctx.shutdown.cancel();
        w.terminated().await;
        assert_eq!(fx.store.get("s.txt").unwrap(), Vec::<u8>::new());
    }
}
