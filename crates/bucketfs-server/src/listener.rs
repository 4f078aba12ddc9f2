//! Unix socket listener for the FUSE front end.
//!
//! Each accepted connection gets its own task. A connection carries any
//! number of requests; each one is answered before the next is read.
//! Framing errors answer `-EPROTO` and drop the connection.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};

use bucketfs_kernel::{ObjectPath, Router};

use crate::protocol::{ProtocolError, Request, Response, read_request, write_response};

/// Socket front of a [`Router`].
pub struct Listener {
    router: Router,
}

impl Listener {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Bind `socket_path`, creating its parent and removing a stale socket.
    pub async fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Remove stale socket
        if tokio::fs::try_exists(socket_path).await? {
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(socket_path)?;
        tracing::info!(path = %socket_path.display(), "bucketfs socket listening");
        Ok(listener)
    }

    /// Bind and serve until the task is cancelled.
    pub async fn run(self: Arc<Self>, socket_path: &Path) -> anyhow::Result<()> {
        let listener = Self::bind(socket_path).await?;
        self.serve(listener).await
    }

    /// Accept connections forever, one task each.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            tracing::debug!("connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> anyhow::Result<()> {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        loop {
            let request = match read_request(&mut reader).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(ProtocolError::Io(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(kind = "protocol", "closing connection: {e}");
                    // Best effort; the peer may already be gone.
                    let _ = write_response(&mut writer, &Response::Status(e.status())).await;
                    return Ok(());
                }
            };

            let response = self.dispatch(request).await;
            write_response(&mut writer, &response).await?;
        }
    }

    /// Execute one request and turn the result into a response frame.
    pub async fn dispatch(&self, request: Request) -> Response {
        let op = request.op.name();
        let path = match ObjectPath::new(&request.path) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(path = %request.path, op, kind = e.kind(), "request failed: {e}");
                return Response::Status(e.status());
            }
        };

        match self.router.execute(&path, request.op).await {
            Ok(outcome) => Response::from_outcome(outcome),
            Err(e) => {
                tracing::warn!(path = %path, op, kind = e.kind(), "request failed: {e}");
                Response::Status(e.status())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketfs_kernel::{MemoryStore, Op, RouterConfig};

    fn listener() -> (Arc<MemoryStore>, Listener) {
        let store = Arc::new(MemoryStore::new());
        let router = Router::new(store.clone(), RouterConfig::default());
        (store, Listener::new(router))
    }

    #[tokio::test]
    async fn test_dispatch_maps_errors_to_status() {
        let (_store, listener) = listener();

        let missing = listener.dispatch(Request::new("nope.txt", Op::Stat)).await;
        assert_eq!(missing, Response::Status(-(libc::ENOENT as i8)));

        let escape = listener.dispatch(Request::new("../etc/passwd", Op::Stat)).await;
        assert_eq!(escape, Response::Status(-(libc::EINVAL as i8)));

        listener.router().shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_normalizes_paths() {
        let (store, listener) = listener();
        store.insert("dir/a.txt", b"abc".to_vec());

        let response = listener
            .dispatch(Request::new("/dir//./a.txt", Op::Read { size: 10, offset: 1 }))
            .await;
        assert_eq!(response, Response::Data(b"bc".to_vec()));

        listener.router().shutdown().await;
    }
}
