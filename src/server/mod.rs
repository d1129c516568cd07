//! Admission daemon: Unix socket listener, worker pool and request dispatch.

mod connection;
mod pool;
mod service;
mod socket;

pub use connection::{serve_connection, ConnectionEnd};
pub use pool::WorkerPool;
pub use service::AdmissionService;
pub use socket::{AdmissionServer, SocketFile};
