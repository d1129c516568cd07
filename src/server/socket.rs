//! Unix socket server for the admission daemon.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use super::pool::WorkerPool;
use super::service::AdmissionService;
use crate::config::ShedderConfig;
use crate::error::{Result, ShedderError};
use crate::limiter::AimdLimiter;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// The socket file owned by a running server.
///
/// The file is removed on [`SocketFile::remove`] or on drop, whichever comes
/// first; later calls do nothing.
#[derive(Debug)]
pub struct SocketFile {
    path: PathBuf,
    removed: AtomicBool,
}

impl SocketFile {
    /// Make `path` ready for binding: create its parent directory and remove
    /// whatever a previous run left behind.
    fn prepare(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(Self {
            path: path.to_path_buf(),
            removed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket file"),
        }
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Admission daemon listening on a Unix socket.
pub struct AdmissionServer {
    listener: UnixListener,
    socket: SocketFile,
    service: Arc<AdmissionService>,
    workers: usize,
    drain_timeout: Duration,
    max_line_bytes: usize,
}

impl AdmissionServer {
    /// Bind the daemon socket with a fresh limiter built from `config`.
    ///
    /// The limiter's initial limit is the worker count.
    pub fn bind(config: &ShedderConfig) -> Result<Self> {
        let initial_limit = u32::try_from(config.workers).unwrap_or(u32::MAX);
        let limiter = Arc::new(AimdLimiter::with_config(
            initial_limit,
            config.target_p95_ms,
            &config.limiter,
        ));
        Self::bind_with_limiter(config, limiter)
    }

    /// Bind the daemon socket around an existing limiter.
    ///
    /// Binding failures are fatal for the daemon and returned as
    /// [`ShedderError::Bind`].
    pub fn bind_with_limiter(config: &ShedderConfig, limiter: Arc<AimdLimiter>) -> Result<Self> {
        let path = config.socket_path.as_path();
        let bind_error = |source: io::Error| ShedderError::Bind {
            path: path.display().to_string(),
            source,
        };

        let socket = SocketFile::prepare(path).map_err(bind_error)?;
        let listener = UnixListener::bind(path).map_err(bind_error)?;

        info!(
            path = %path.display(),
            workers = config.workers,
            target_p95_ms = config.target_p95_ms,
            "Admission socket bound"
        );

        Ok(Self {
            listener,
            socket,
            service: Arc::new(AdmissionService::new(limiter)),
            workers: config.workers,
            drain_timeout: config.drain_timeout(),
            max_line_bytes: config.server.max_line_bytes,
        })
    }

    /// Path of the listening socket.
    pub fn socket_path(&self) -> &Path {
        self.socket.path()
    }

    /// The limiter served by this daemon.
    pub fn limiter(&self) -> Arc<AimdLimiter> {
        self.service.limiter().clone()
    }

    /// Accept connections until `signal` resolves, then shut down.
    ///
    /// Shutdown closes the listening socket, drains the worker pool within the
    /// configured timeout and removes the socket file.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            listener,
            socket,
            service,
            workers,
            drain_timeout,
            max_line_bytes,
        } = self;

        let mut pool = WorkerPool::spawn(workers, service, max_line_bytes);
        info!(path = %socket.path().display(), workers, "Accepting connections");

        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::select! {
                            submitted = pool.submit(stream) => {
                                if let Err(e) = submitted {
                                    error!(error = %e, "Worker pool rejected connection");
                                    break;
                                }
                            }
                            _ = &mut signal => {
                                info!("Shutdown requested");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        pool.shutdown(drain_timeout).await;
        socket.remove();
        info!("Admission server stopped");
        Ok(())
    }
}
