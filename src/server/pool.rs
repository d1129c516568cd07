//! Bounded worker pool fed by a queue of accepted connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info_span, warn, Instrument};

use super::connection::{serve_connection, ConnectionEnd};
use super::service::AdmissionService;
use crate::error::{Result, ShedderError};

/// A fixed set of workers, each owning one connection at a time.
///
/// Connections beyond the worker count wait in the queue until a worker
/// frees up.
pub struct WorkerPool {
    queue: Option<mpsc::Sender<UnixStream>>,
    shutdown: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `size` workers serving connections through `service`.
    pub fn spawn(size: usize, service: Arc<AdmissionService>, max_line_bytes: usize) -> Self {
        let size = size.max(1);
        let (queue, receiver) = mpsc::channel(size);
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut workers = JoinSet::new();
        for id in 0..size {
            workers.spawn(worker_loop(
                id,
                receiver.clone(),
                service.clone(),
                max_line_bytes,
                shutdown_rx.clone(),
            ));
        }

        Self {
            queue: Some(queue),
            shutdown,
            workers,
        }
    }

    /// Queue an accepted connection, waiting while the queue is full.
    pub async fn submit(&self, stream: UnixStream) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| ShedderError::Protocol("worker pool is shut down".into()))?;
        queue
            .send(stream)
            .await
            .map_err(|_| ShedderError::Protocol("worker pool is shut down".into()))
    }

    /// Number of workers still running.
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking work and let workers drain.
    ///
    /// Idle workers stop immediately; a worker in the middle of a request
    /// finishes it first. Workers still running after `timeout` are aborted,
    /// which closes their connections. Calling this more than once is a no-op.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.queue.take();
        let _ = self.shutdown.send(true);

        let drained = tokio::time::timeout(timeout, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.workers.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Workers did not drain in time, force-closing connections"
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<UnixStream>>>,
    service: Arc<AdmissionService>,
    max_line_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut served: u64 = 0;
    loop {
        // Only one idle worker waits on the queue at a time; the rest wait
        // for the lock.
        let stream = {
            let mut queue = queue.lock().await;
            tokio::select! {
                stream = queue.recv() => stream,
                _ = shutdown.changed() => None,
            }
        };
        let Some(stream) = stream else {
            break;
        };

        served += 1;
        let span = info_span!("connection", worker = id, seq = served);
        match serve_connection(stream, &service, max_line_bytes, &mut shutdown)
            .instrument(span)
            .await
        {
            Ok(ConnectionEnd::Closed) => debug!(worker = id, "Connection closed by peer"),
            Ok(ConnectionEnd::Shutdown) => break,
            Err(e) => warn!(worker = id, error = %e, "Connection error"),
        }
    }
    debug!(worker = id, served, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::AimdLimiter;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn service() -> Arc<AdmissionService> {
        Arc::new(AdmissionService::new(Arc::new(AimdLimiter::new(4, 300))))
    }

    #[tokio::test]
    async fn test_pool_serves_submitted_connections() {
        let mut pool = WorkerPool::spawn(2, service(), 1024);
        assert_eq!(pool.active_workers(), 2);

        let (server_side, client_side) = UnixStream::pair().unwrap();
        pool.submit(server_side).await.unwrap();

        let mut client = BufReader::new(client_side);
        client.get_mut().write_all(b"ADMIT kind=anon\n").await.unwrap();
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "OK limit=4 inflight=1 degraded=0\n");

        pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connections() {
        let mut pool = WorkerPool::spawn(1, service(), 1024);
        let (server_side, client_side) = UnixStream::pair().unwrap();
        pool.submit(server_side).await.unwrap();

        let mut client = BufReader::new(client_side);
        client.get_mut().write_all(b"STATS\n").await.unwrap();
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();

        pool.shutdown(Duration::from_secs(1)).await;

        line.clear();
        let read = client.read_line(&mut line).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let mut pool = WorkerPool::spawn(1, service(), 1024);
        pool.shutdown(Duration::from_millis(100)).await;
        pool.shutdown(Duration::from_millis(100)).await;

        let (server_side, _client_side) = UnixStream::pair().unwrap();
        assert!(pool.submit(server_side).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_workers_past_drain_timeout() {
        let mut pool = WorkerPool::spawn(1, service(), 1024);
        let (server_side, client_side) = UnixStream::pair().unwrap();
        pool.submit(server_side).await.unwrap();

        // Half a request line keeps the worker busy through the drain window
        let mut client = BufReader::new(client_side);
        client.get_mut().write_all(b"ADMIT kind=").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.shutdown(Duration::from_millis(20)).await;
        assert_eq!(pool.active_workers(), 0);

        let mut line = String::new();
        let read = client.read_line(&mut line).await.unwrap();
        assert_eq!(read, 0);
    }
}
