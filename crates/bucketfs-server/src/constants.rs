//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

/// File name of the socket inside the runtime directory.
pub const DEFAULT_SOCKET_NAME: &str = "bucketfs.sock";

/// Directory used for the socket when no runtime dir is available.
pub const FALLBACK_SOCKET_DIR: &str = "/tmp";

/// Region passed to the S3 client when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Longest accepted request path in bytes, excluding the NUL.
pub const MAX_PATH_LEN: usize = 4096;

/// Largest read size or write payload accepted in one request.
pub const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;
