//! Unix domain socket listener and per-connection request loop.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use super::protocol::{
    decode_request, encode_response, read_frame, recover_id, Frame, Response, Status,
};
use super::router::Router;

const BIND_ATTEMPTS: u32 = 5;
const BIND_BACKOFF: Duration = Duration::from_millis(100);

/// Transport error types.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {} after {attempts} attempts: {source}", .path.display())]
    Bind {
        path: PathBuf,
        attempts: u32,
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Timeouts applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// How long a connection may sit without sending a request.
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1800),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// A bound socket that is not yet accepting connections.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind to `path`, replacing any stale socket file left behind.
    pub async fn bind<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let mut attempt = 1;

        loop {
            remove_socket_file(&path);

            match UnixListener::bind(&path) {
                Ok(listener) => return Ok(Self { listener, path }),
                Err(e) if attempt < BIND_ATTEMPTS => {
                    tracing::warn!(
                        "Bind attempt {}/{} on {} failed: {}",
                        attempt,
                        BIND_ATTEMPTS,
                        path.display(),
                        e
                    );
                    tokio::time::sleep(BIND_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(TransportError::Bind {
                        path,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires, then remove the socket file.
    pub async fn serve(
        self,
        router: Arc<Router>,
        options: ConnectionOptions,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutting down listener on {}", self.path.display());
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let router = router.clone();
                        let shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            let served = handle_connection(stream, router, options, shutdown);
                            if let Err(e) = served.await {
                                tracing::warn!("Connection closed with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        drop(self.listener);
        remove_socket_file(&self.path);
        Ok(())
    }
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed socket file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Serve requests on one connection until EOF, idle timeout or shutdown.
async fn handle_connection(
    stream: UnixStream,
    router: Arc<Router>,
    options: ConnectionOptions,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    tracing::debug!("Connection opened");

    loop {
        let next = tokio::time::timeout(options.idle_timeout, read_frame(&mut reader));
        let frame = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            frame = next => match frame {
                Ok(frame) => frame?,
                Err(_) => {
                    tracing::info!("Closing connection idle for {:?}", options.idle_timeout);
                    return Ok(());
                }
            }
        };

        let response = match frame {
            Frame::Eof => {
                tracing::debug!("Connection closed by peer");
                return Ok(());
            }
            Frame::Oversized => {
                tracing::warn!("Rejected request larger than 64 KiB");
                Response::failure("", Status::BadRequest, "request too large")
            }
            Frame::Line(line) if line.iter().all(u8::is_ascii_whitespace) => continue,
            Frame::Line(line) => process_frame(&router, &line),
        };

        write_response(&mut write_half, &response, options.write_timeout).await?;
    }
}

/// Decode one frame, dispatch it and build the response.
pub(crate) fn process_frame(router: &Router, frame: &[u8]) -> Response {
    match decode_request(frame) {
        Ok(req) => {
            tracing::debug!("{:?} {} (request {})", req.action, req.resource, req.id);
            let mut resp = Response::for_request(&req);
            router.dispatch(&req, &mut resp);
            resp
        }
        Err(e) => {
            tracing::warn!("Malformed request: {}", e);
            let message = format!("malformed request: {}", e);
            Response::failure(recover_id(frame), Status::BadRequest, message)
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &Response,
    timeout: Duration,
) -> Result<(), TransportError> {
    let bytes = encode_response(resp)?;

    tokio::time::timeout(timeout, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;

    Ok(())
}
