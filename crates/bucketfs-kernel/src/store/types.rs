//! Core remote-store types.
//!
//! Object paths are plain keys, not filesystem paths: the bucket has no
//! real directories, only `/`-separated prefixes.

use std::fmt;
use std::time::SystemTime;

use crate::error::{FsError, FsResult};

/// Normalized key identifying an object (or prefix) in the bucket.
///
/// Normalization strips leading and trailing `/`, collapses empty
/// components and drops `.`. A `..` component is rejected. The empty key
/// is the bucket root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Normalize a raw path from the front end.
    pub fn new(raw: &str) -> FsResult<Self> {
        let mut parts = Vec::new();
        for component in raw.split('/') {
            match component {
                "" | "." => continue,
                ".." => return Err(FsError::invalid_path(raw)),
                c if c.contains('\0') => return Err(FsError::invalid_path(raw)),
                c => parts.push(c),
            }
        }
        Ok(Self(parts.join("/")))
    }

    /// The bucket root.
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Last component, or `""` for the root.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Parent path. The root is its own parent.
    pub fn parent(&self) -> ObjectPath {
        match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::root(),
        }
    }

    /// Key prefix under which this path's children live (`"a/b/"`, or `""`
    /// for the root).
    pub fn dir_prefix(&self) -> String {
        if self.is_root() {
            String::new()
        } else {
            format!("{}/", self.0)
        }
    }

    /// Child path. `name` must be a single component.
    pub fn join(&self, name: &str) -> FsResult<ObjectPath> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(FsError::invalid_path(name));
        }
        if self.is_root() {
            Ok(Self(name.to_string()))
        } else {
            Ok(Self(format!("{}/{}", self.0, name)))
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Object kind as seen through the file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ObjectKind {
    File,
    Directory,
}

impl ObjectKind {
    pub fn is_file(&self) -> bool {
        matches!(self, ObjectKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ObjectKind::Directory)
    }
}

/// Attributes of a single object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttr {
    /// Size in bytes (0 for directories).
    pub size: u64,
    pub kind: ObjectKind,
    /// Last modification time, when the store reports one.
    pub modified: Option<SystemTime>,
}

impl ObjectAttr {
    pub fn file(size: u64) -> Self {
        Self {
            size,
            kind: ObjectKind::File,
            modified: None,
        }
    }

    pub fn directory() -> Self {
        Self {
            size: 0,
            kind: ObjectKind::Directory,
            modified: None,
        }
    }

    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }
}

/// One entry of a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Entry name relative to the listed prefix (single component).
    pub name: String,
    pub kind: ObjectKind,
    pub size: u64,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::File,
            size,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Directory,
            size: 0,
        }
    }
}
