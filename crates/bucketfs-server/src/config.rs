//! Process configuration: command line with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use bucketfs_kernel::{RouterConfig, S3Config};

use crate::constants::{DEFAULT_REGION, DEFAULT_SOCKET_NAME, FALLBACK_SOCKET_DIR};

/// Configuration problem found at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {flag} (or {env}); required unless --local-root is given")]
    Missing {
        flag: &'static str,
        env: &'static str,
    },

    #[error("local root {0} is not a directory")]
    LocalRootNotDir(PathBuf),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn parse_secs(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("`{raw}` is not a number of seconds: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("`{raw}`: {e}"))
}

/// bucketfs-server - serve an S3 bucket to a FUSE front end over a Unix socket
#[derive(Debug, Parser)]
#[command(name = "bucketfs-server", version, about)]
pub struct ServerArgs {
    /// S3 endpoint URL, e.g. http://localhost:9000
    #[arg(long, env = "BUCKETFS_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, env = "BUCKETFS_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,

    #[arg(long, env = "BUCKETFS_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    #[arg(long, env = "BUCKETFS_BUCKET")]
    pub bucket: Option<String>,

    #[arg(long, env = "BUCKETFS_REGION", default_value = DEFAULT_REGION)]
    pub region: String,

    /// Serve a local directory instead of a bucket
    #[arg(long, env = "BUCKETFS_LOCAL_ROOT")]
    pub local_root: Option<PathBuf>,

    /// Socket path [default: $XDG_RUNTIME_DIR/bucketfs.sock]
    #[arg(long, env = "BUCKETFS_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Parent directory for per-worker scratch files
    #[arg(long, env = "BUCKETFS_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Idle seconds before a worker with no open handle terminates
    #[arg(long, env = "BUCKETFS_TIMEOUT_CLOSED", value_parser = parse_secs, default_value = "5")]
    pub timeout_closed: Duration,

    /// Idle seconds before a worker that served a read terminates
    #[arg(long, env = "BUCKETFS_TIMEOUT_OPEN_READ", value_parser = parse_secs, default_value = "60")]
    pub timeout_open_read: Duration,

    /// Seconds a cached stat or listing stays fresh
    #[arg(long, env = "BUCKETFS_METADATA_TTL", value_parser = parse_secs, default_value = "10")]
    pub metadata_ttl: Duration,

    /// Seconds between registry and metadata sweeps
    #[arg(long, env = "BUCKETFS_SWEEP_INTERVAL", value_parser = parse_secs, default_value = "1")]
    pub sweep_interval: Duration,
}

/// Where objects live.
#[derive(Debug, Clone)]
pub enum Backend {
    S3(S3Config),
    Local(PathBuf),
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub backend: Backend,
    pub socket: PathBuf,
    pub router: RouterConfig,
}

impl ServerConfig {
    /// Validate arguments and fill in defaults.
    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let backend = match args.local_root {
            Some(root) => {
                if !root.is_dir() {
                    return Err(ConfigError::LocalRootNotDir(root));
                }
                Backend::Local(root)
            }
            None => Backend::S3(S3Config {
                endpoint: required(args.endpoint, "--endpoint", "BUCKETFS_ENDPOINT")?,
                access_key: required(args.access_key, "--access-key", "BUCKETFS_ACCESS_KEY")?,
                secret_key: required(args.secret_key, "--secret-key", "BUCKETFS_SECRET_KEY")?,
                bucket: required(args.bucket, "--bucket", "BUCKETFS_BUCKET")?,
                region: args.region,
            }),
        };

        // tokio's interval panics on a zero period.
        if args.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "sweep interval",
                reason: "must be greater than zero".into(),
            });
        }

        let mut router = RouterConfig::default()
            .with_timeouts(args.timeout_closed, args.timeout_open_read)
            .with_metadata_ttl(args.metadata_ttl)
            .with_sweep_interval(args.sweep_interval);
        if let Some(dir) = args.scratch_dir {
            router = router.with_scratch_dir(dir);
        }

        Ok(Self {
            backend,
            socket: args.socket.unwrap_or_else(default_socket_path),
            router,
        })
    }
}

fn required(
    value: Option<String>,
    flag: &'static str,
    env: &'static str,
) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing { flag, env })
}

/// `$XDG_RUNTIME_DIR/bucketfs.sock`, falling back to `/tmp`.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_SOCKET_DIR))
        .join(DEFAULT_SOCKET_NAME)
}
