//! Remote store backends.

mod local;
mod memory;
mod s3;

pub use local::LocalDirStore;
pub use memory::{MemoryStore, StoreOp};
pub use s3::{S3Config, S3Store};
