//! # bucketfs-kernel
//!
//! Engine behind the bucketfs backend: presents an S3-compatible bucket as
//! a POSIX-like file system to a FUSE front end.
//!
//! - [`store`] - Remote object store trait and backends
//! - [`cache`] - Per-path local staging file
//! - [`worker`] - One task per open path, executing its operations in order
//! - [`metadata`] - TTL cache of stat results and listings
//! - [`router`] - Path → worker registry and routing policy

pub mod cache;
pub mod config;
pub mod error;
pub mod metadata;
pub mod router;
pub mod store;
pub mod worker;

pub use cache::{CacheState, LocalCacheEntry};
pub use config::RouterConfig;
pub use error::{FsError, FsResult};
pub use metadata::{Metadata, MetadataCache, MetadataCacheEntry, MetadataKind};
pub use router::{Router, RouterStats};
pub use store::{
    LocalDirStore, MemoryStore, ObjectAttr, ObjectKind, ObjectPath, RemoteEntry, RemoteError,
    RemoteResult, RemoteStore, S3Config, S3Store, StoreOp,
};
pub use worker::{Delivery, DrainReason, Lifecycle, Op, OpClass, Outcome, WorkerHandle, WorkerId};
