//! Engine error types.

use std::io;
use thiserror::Error;

use crate::store::RemoteError;

/// Error returned by router and worker operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The remote store failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The local cache file failed.
    #[error("local I/O error: {0}")]
    LocalIo(#[from] io::Error),

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Operation not allowed in the cache entry's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The worker went away without answering.
    #[error("worker gone")]
    WorkerGone,
}

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Short stable label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FsError::Remote(e) => e.kind(),
            FsError::LocalIo(_) => "local_io",
            FsError::NotFound(_) => "not_found",
            FsError::AlreadyExists(_) => "already_exists",
            FsError::NotADirectory(_) => "not_a_directory",
            FsError::IsADirectory(_) => "is_a_directory",
            FsError::DirectoryNotEmpty(_) => "directory_not_empty",
            FsError::PermissionDenied(_) => "permission_denied",
            FsError::InvalidPath(_) => "invalid_path",
            FsError::InvalidState(_) => "invalid_state",
            FsError::Timeout(_) => "timeout",
            FsError::WorkerGone => "worker_gone",
        }
    }

    /// Wire status: a negated errno.
    pub fn status(&self) -> i8 {
        let errno = match self {
            FsError::Remote(RemoteError::NotFound(_)) | FsError::NotFound(_) => libc::ENOENT,
            FsError::Remote(RemoteError::QuotaExceeded(_)) => libc::ENOSPC,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::InvalidPath(_) => libc::EINVAL,
            FsError::Timeout(_) => libc::ETIMEDOUT,
            FsError::LocalIo(e) if e.kind() == io::ErrorKind::StorageFull => libc::ENOSPC,
            FsError::Remote(RemoteError::Io(_))
            | FsError::LocalIo(_)
            | FsError::InvalidState(_)
            | FsError::WorkerGone => libc::EIO,
        };
        -(errno as i8)
    }

    /// Whether this is a not-found error, local or remote.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_) | FsError::Remote(RemoteError::NotFound(_)))
    }
}

/// Engine result type.
pub type FsResult<T> = Result<T, FsError>;
