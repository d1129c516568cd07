//! Client side of the admission protocol.

mod backend;
mod connection;

pub use backend::{AdmissionBackend, SharedClient};
pub use connection::{AdmissionClient, ClientDecision, CompletionReport};
