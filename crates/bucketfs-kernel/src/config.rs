//! Router tuning knobs.

use std::path::PathBuf;
use std::time::Duration;

/// Timeouts and paths used by the router and its workers.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Idle time after which a worker with no open read handle drains.
    pub timeout_closed: Duration,
    /// Idle time after which a worker that has served a read drains.
    pub timeout_open_read: Duration,
    /// How long a cached stat or listing stays fresh.
    pub metadata_ttl: Duration,
    /// Period of the sweeper's housekeeping tick.
    pub sweep_interval: Duration,
    /// Parent directory for per-worker scratch directories.
    /// `None` uses the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl RouterConfig {
    pub const DEFAULT_TIMEOUT_CLOSED: Duration = Duration::from_secs(5);
    pub const DEFAULT_TIMEOUT_OPEN_READ: Duration = Duration::from_secs(60);
    pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(10);
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

    pub fn with_timeouts(mut self, closed: Duration, open_read: Duration) -> Self {
        self.timeout_closed = closed;
        self.timeout_open_read = open_read;
        self
    }

    pub fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Idle timeout for a worker, depending on whether it holds a read handle.
    pub fn idle_timeout(&self, read_open: bool) -> Duration {
        if read_open {
            self.timeout_open_read
        } else {
            self.timeout_closed
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            timeout_closed: Self::DEFAULT_TIMEOUT_CLOSED,
            timeout_open_read: Self::DEFAULT_TIMEOUT_OPEN_READ,
            metadata_ttl: Self::DEFAULT_METADATA_TTL,
            sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
            scratch_dir: None,
        }
    }
}
