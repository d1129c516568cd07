//! Per-connection request loop.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::service::AdmissionService;
use crate::error::{Result, ShedderError};
use crate::protocol;

/// Why a connection loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The peer closed its side.
    Closed,
    /// The server is shutting down.
    Shutdown,
}

/// Serve request lines from `stream` until EOF, error or shutdown.
///
/// Each line is answered before the next one is read. Lines longer than
/// `max_line_bytes` (terminator included) or not valid UTF-8 get
/// `ERR unknown` and end the connection with a protocol error. A trailing
/// partial line at EOF is dropped unanswered.
///
/// Shutdown ends the loop between requests. A line that has started to
/// arrive is still read and answered first.
pub async fn serve_connection<S>(
    stream: S,
    service: &AdmissionService,
    max_line_bytes: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ConnectionEnd>
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(64);

    loop {
        if *shutdown.borrow() {
            return Ok(ConnectionEnd::Shutdown);
        }

        buf.clear();
        let mut limited = (&mut reader).take(max_line_bytes as u64);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => read?,
            _ = shutdown.changed() => {
                if buf.is_empty() {
                    return Ok(ConnectionEnd::Shutdown);
                }
                // A request is already arriving; answer it before stopping.
                limited.read_until(b'\n', &mut buf).await?
            }
        };

        if read == 0 {
            return Ok(ConnectionEnd::Closed);
        }

        if buf.last() != Some(&b'\n') {
            if buf.len() >= max_line_bytes {
                writer.write_all(protocol::ERR_UNKNOWN.as_bytes()).await?;
                return Err(ShedderError::Protocol(format!(
                    "request line exceeds {} bytes",
                    max_line_bytes
                )));
            }
            debug!(bytes = buf.len(), "Dropping partial line at EOF");
            return Ok(ConnectionEnd::Closed);
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim_end_matches(&['\n', '\r'][..]),
            Err(_) => {
                writer.write_all(protocol::ERR_UNKNOWN.as_bytes()).await?;
                return Err(ShedderError::Protocol("request line is not UTF-8".into()));
            }
        };

        trace!(line = %line, "Request");
        let reply = service.handle_line(line);
        writer.write_all(reply.as_bytes()).await?;
    }
}
