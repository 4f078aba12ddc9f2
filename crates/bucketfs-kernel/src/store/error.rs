//! Remote store error types.

use std::io;
use thiserror::Error;

/// Failure reported by a [`RemoteStore`](super::RemoteStore) backend.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Object (or prefix) does not exist.
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// Network or service failure. Considered transient.
    #[error("remote I/O error: {0}")]
    Io(String),

    /// Store refused the upload for lack of space or quota.
    #[error("remote quota exceeded: {0}")]
    QuotaExceeded(String),
}

impl RemoteError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    /// Whether a single retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Io(_))
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::NotFound(_) => "remote_not_found",
            RemoteError::Io(_) => "remote_io",
            RemoteError::QuotaExceeded(_) => "remote_quota_exceeded",
        }
    }
}

/// Local-disk side of a transfer failed (staging file unreadable, etc.).
///
/// A missing local file is an I/O failure, never a missing object; backends
/// report absent objects with [`RemoteError::not_found`] themselves.
impl From<io::Error> for RemoteError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                RemoteError::QuotaExceeded(e.to_string())
            }
            _ => RemoteError::Io(e.to_string()),
        }
    }
}

/// Remote store result type.
pub type RemoteResult<T> = Result<T, RemoteError>;
