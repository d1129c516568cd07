//! Load Shedder - Adaptive Admission Control
//!
//! A local daemon owns an AIMD concurrency limiter and answers admission
//! requests over a Unix socket. Web workers ask it for a slot before running
//! a request and report the outcome afterwards; the limit shrinks when
//! completions get slow and grows back while they stay fast. Anonymous
//! traffic is shed with `503` once the limit is reached, authenticated
//! traffic is always let through, and everything fails open when the daemon
//! cannot be reached.

pub mod client;
pub mod config;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod protocol;
pub mod server;
