//! Admission backend trait for abstracting the daemon connection.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::connection::{AdmissionClient, ClientDecision, CompletionReport};
use crate::protocol::RequestKind;

/// Source of admission decisions for the HTTP middleware.
///
/// Implementations must not fail: an unreachable backend answers with
/// [`ClientDecision::fail_open`] and drops completion reports.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Ask whether an operation of the given kind may start.
    async fn admit(&self, kind: RequestKind) -> ClientDecision;

    /// Report that an admitted operation finished. Returns whether the
    /// report was delivered.
    async fn complete(&self, report: CompletionReport) -> bool;
}

/// An [`AdmissionClient`] behind an async mutex so concurrent requests can
/// share its single connection. Each call holds the lock for one round trip.
///
/// All admission traffic of the process goes through that one connection,
/// so it occupies a single daemon worker and round trips are serialized.
/// Processes with many concurrent requests can implement
/// [`AdmissionBackend`] over several clients instead.
#[derive(Debug)]
pub struct SharedClient {
    client: Mutex<AdmissionClient>,
}

impl SharedClient {
    pub fn new(client: AdmissionClient) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

#[async_trait]
impl AdmissionBackend for SharedClient {
    async fn admit(&self, kind: RequestKind) -> ClientDecision {
        self.client.lock().await.admit(kind).await
    }

    async fn complete(&self, report: CompletionReport) -> bool {
        self.client.lock().await.complete(&report).await
    }
}
