//! bucketfs server library
//!
//! Unix-socket front of the bucketfs backend: request framing, the
//! connection listener and process configuration.

pub mod config;
pub mod constants;
pub mod listener;
pub mod protocol;

pub use config::{Backend, ConfigError, ServerArgs, ServerConfig};
pub use listener::Listener;
pub use protocol::{OpCode, ProtocolError, Request, Response};
