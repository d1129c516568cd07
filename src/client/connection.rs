//! Connection to the admission daemon.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::ShedderConfig;
use crate::error::{Result, ShedderError};
use crate::limiter::LimiterStats;
use crate::protocol::{self, AdmitReply, Command, RequestKind};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Admission decision as seen by a caller of the daemon.
///
/// `contacted` tells a real verdict apart from the fail-open default that is
/// returned when the daemon could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientDecision {
    pub admitted: bool,
    pub limit: Option<u32>,
    pub inflight: Option<u32>,
    pub degraded: bool,
    pub contacted: bool,
}

impl ClientDecision {
    /// Admit without metering.
    pub fn fail_open() -> Self {
        Self {
            admitted: true,
            limit: None,
            inflight: None,
            degraded: false,
            contacted: false,
        }
    }
}

impl From<AdmitReply> for ClientDecision {
    fn from(reply: AdmitReply) -> Self {
        Self {
            admitted: reply.admitted,
            limit: reply.limit,
            inflight: reply.inflight,
            degraded: reply.degraded,
            contacted: true,
        }
    }
}

/// Outcome of an admitted operation, reported back to the daemon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionReport {
    pub status: u16,
    pub rtt_ms: f64,
    /// Whether the latency should tune the limit
    pub sampled: bool,
}

/// Client for the admission daemon.
///
/// Holds at most one connection, opened on first use and dropped after any
/// error so the next call reconnects. Calls are never retried. Methods take
/// `&mut self`; share a client between tasks through
/// [`SharedClient`](super::SharedClient).
#[derive(Debug)]
pub struct AdmissionClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
    connection: Option<BufReader<UnixStream>>,
}

impl AdmissionClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection: None,
        }
    }

    pub fn from_config(config: &ShedderConfig) -> Self {
        Self::new(&config.socket_path).with_connect_timeout(config.connect_timeout())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Ask the daemon for admission, admitting by default if it is
    /// unreachable or answers with something unexpected.
    pub async fn admit(&mut self, kind: RequestKind) -> ClientDecision {
        match self.try_admit(kind).await {
            Ok(decision) => decision,
            Err(e) => {
                debug!(error = %e, "Admission daemon unavailable, failing open");
                ClientDecision::fail_open()
            }
        }
    }

    /// Ask the daemon for admission, returning transport and protocol errors.
    pub async fn try_admit(&mut self, kind: RequestKind) -> Result<ClientDecision> {
        let line = self.round_trip(&Command::Admit { kind }).await?;
        match protocol::parse_admit_reply(&line) {
            Ok(reply) => Ok(reply.into()),
            Err(e) => {
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Report a completion. Returns whether the daemon acknowledged it;
    /// failures are logged and otherwise ignored.
    pub async fn complete(&mut self, report: &CompletionReport) -> bool {
        let command = Command::Complete {
            rtt_ms: report.rtt_ms,
            status: Some(report.status),
            sample: report.sampled,
        };
        match self.round_trip(&command).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Failed to report completion");
                false
            }
        }
    }

    /// Fetch the daemon's current limiter state.
    pub async fn stats(&mut self) -> Result<LimiterStats> {
        let line = self.round_trip(&Command::Stats).await?;
        protocol::parse_stats_reply(&line).map_err(|e| {
            self.disconnect();
            e
        })
    }

    /// Drop the current connection, if any.
    pub fn disconnect(&mut self) {
        self.connection = None;
    }

    /// Send one command and read its reply.
    ///
    /// The connection is taken out of `self` for the duration of the
    /// exchange and only put back once a full reply has been read. A call
    /// that fails or is cancelled midway leaves the client disconnected,
    /// so a late reply can never be read as the answer to a later command.
    async fn round_trip(&mut self, command: &Command) -> Result<String> {
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.connect().await?,
        };
        let line = exchange(&mut connection, command).await?;
        self.connection = Some(connection);
        Ok(line)
    }

    async fn connect(&self) -> Result<BufReader<UnixStream>> {
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| {
                ShedderError::Timeout(format!("connecting to {}", self.socket_path.display()))
            })??;
        debug!(path = %self.socket_path.display(), "Connected to admission daemon");
        Ok(BufReader::new(stream))
    }
}

async fn exchange(connection: &mut BufReader<UnixStream>, command: &Command) -> Result<String> {
    connection
        .get_mut()
        .write_all(command.encode().as_bytes())
        .await?;

    let mut line = String::new();
    if connection.read_line(&mut line).await? == 0 {
        return Err(ShedderError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "daemon closed the connection",
        )));
    }
    Ok(line.trim_end().to_string())
}
