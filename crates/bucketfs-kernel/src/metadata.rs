//! Ownerless metadata cache.
//!
//! Holds stat results and directory listings for paths without a live
//! worker. Entries are replaced wholesale on insert and expire after a TTL.
//! A live worker is always authoritative over anything stored here.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::store::{ObjectAttr, ObjectPath, RemoteEntry};

/// Which kind of metadata an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MetadataKind {
    Stat,
    Listing,
}

/// Cached metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    Attr(ObjectAttr),
    /// The path is known not to exist.
    Missing,
    Listing(Vec<RemoteEntry>),
}

/// A metadata value and when it was stored.
#[derive(Debug, Clone)]
pub struct MetadataCacheEntry {
    pub metadata: Metadata,
    pub cached_at: Instant,
}

impl MetadataCacheEntry {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            cached_at: Instant::now(),
        }
    }

    /// Check if this entry is stale based on TTL.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// TTL cache keyed by `(path, kind)`.
#[derive(Debug)]
pub struct MetadataCache {
    entries: DashMap<(ObjectPath, MetadataKind), MetadataCacheEntry>,
    ttl: Duration,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get an entry if present and not stale.
    pub fn get_fresh(&self, path: &ObjectPath, kind: MetadataKind) -> Option<Metadata> {
        let key = (path.clone(), kind);
        self.entries
            .get(&key)
            .filter(|entry| !entry.is_stale(self.ttl))
            .map(|entry| entry.metadata.clone())
    }

    /// Insert or replace an entry.
    pub fn insert(&self, path: ObjectPath, kind: MetadataKind, metadata: Metadata) {
        self.entries.insert((path, kind), MetadataCacheEntry::new(metadata));
    }

    /// Record a stat result for `path`.
    pub fn put_attr(&self, path: &ObjectPath, attr: ObjectAttr) {
        self.insert(path.clone(), MetadataKind::Stat, Metadata::Attr(attr));
    }

    /// Record that `path` does not exist. Its own listing is dropped too.
    pub fn put_missing(&self, path: &ObjectPath) {
        self.insert(path.clone(), MetadataKind::Stat, Metadata::Missing);
        self.entries.remove(&(path.clone(), MetadataKind::Listing));
    }

    /// Drop one entry.
    pub fn invalidate(&self, path: &ObjectPath, kind: MetadataKind) {
        self.entries.remove(&(path.clone(), kind));
    }

    /// Drop the stat and listing of `path` plus its parent's listing.
    pub fn invalidate_with_parent(&self, path: &ObjectPath) {
        self.invalidate(path, MetadataKind::Stat);
        self.invalidate(path, MetadataKind::Listing);
        if !path.is_root() {
            self.invalidate(&path.parent(), MetadataKind::Listing);
        }
    }

    /// Remove every stale entry. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(self.ttl));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
