//! Request dispatch for the admission daemon.

use std::sync::Arc;
use tracing::{debug, trace};

use crate::limiter::AimdLimiter;
use crate::protocol::{self, Command};

/// Maps request lines onto limiter operations.
///
/// The service holds no state of its own; everything lives in the shared
/// limiter, so one instance is shared by all workers.
pub struct AdmissionService {
    limiter: Arc<AimdLimiter>,
}

impl AdmissionService {
    /// Create a new service delegating to the given limiter.
    pub fn new(limiter: Arc<AimdLimiter>) -> Self {
        Self { limiter }
    }

    /// The limiter this service delegates to.
    pub fn limiter(&self) -> &Arc<AimdLimiter> {
        &self.limiter
    }

    /// Handle one request line and produce the reply line, terminator
    /// included. Lines that do not parse get `ERR unknown`.
    pub fn handle_line(&self, line: &str) -> String {
        match Command::parse(line) {
            Ok(Command::Admit { kind }) => {
                let decision = self.limiter.admit();
                trace!(
                    kind = %kind,
                    admitted = decision.admitted,
                    limit = decision.limit,
                    inflight = decision.inflight,
                    "ADMIT"
                );
                protocol::encode_decision(&decision)
            }
            Ok(Command::Complete {
                rtt_ms,
                status,
                sample,
            }) => {
                self.limiter.complete(rtt_ms, sample);
                trace!(rtt_ms, status = ?status, sample, "COMPLETE");
                protocol::ACK.to_string()
            }
            Ok(Command::Stats) => protocol::encode_stats(&self.limiter.stats()),
            Err(e) => {
                debug!(error = %e, line = %line, "Rejecting request line");
                protocol::ERR_UNKNOWN.to_string()
            }
        }
    }
}
