//! bucketfs-server binary
//!
//! Serves an S3 bucket (or a local directory) to the FUSE front end over a
//! Unix socket.
//!
//! ## Usage
//!
//! ```bash
//! # Against MinIO
//! BUCKETFS_SECRET_KEY=... bucketfs-server --endpoint http://localhost:9000 \
//!     --access-key minio --bucket data
//!
//! # Against a local directory
//! bucketfs-server --local-root /srv/bucket --socket /tmp/bucketfs.sock
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use bucketfs_kernel::{LocalDirStore, RemoteStore, Router, S3Store};
use bucketfs_server::{Backend, Listener, ServerArgs, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    let _otel_guard = if bucketfs_telemetry::otel_enabled() {
        match bucketfs_telemetry::otel_layer("bucketfs-server") {
            Ok((otel_layer, guard)) => {
                registry.with(otel_layer).init();
                Some(guard)
            }
            Err(e) => {
                registry.init();
                tracing::warn!("OTel export disabled: {e}");
                None
            }
        }
    } else {
        registry.init();
        None
    };

    #[cfg(not(feature = "telemetry"))]
    registry.init();

    let config = match ServerConfig::from_args(ServerArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bucketfs-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run_server(config).await {
        tracing::error!("Server error: {e:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let store: Arc<dyn RemoteStore> = match config.backend {
        Backend::S3(s3) => {
            tracing::info!(endpoint = %s3.endpoint, bucket = %s3.bucket, "using S3 backend");
            Arc::new(S3Store::new(s3).await)
        }
        Backend::Local(root) => {
            tracing::info!(root = %root.display(), "using local directory backend");
            Arc::new(LocalDirStore::new(root))
        }
    };

    let router = Router::new(store, config.router);
    let listener = Arc::new(Listener::new(router.clone()));

    let mut terminate = signal(SignalKind::terminate())?;
    let result = tokio::select! {
        result = listener.run(&config.socket) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
        _ = terminate.recv() => {
            tracing::info!("terminated, shutting down");
            Ok(())
        }
    };

    // Dirty caches are uploaded before exit.
    router.shutdown().await;

    if let Err(e) = tokio::fs::remove_file(&config.socket).await {
        tracing::debug!("socket cleanup: {e}");
    }

    result
}
