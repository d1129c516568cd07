//! Configuration management for the load shedder.
//!
//! Values come from an optional configuration file (any format the `config`
//! crate understands, chosen by extension) overlaid with environment
//! variables prefixed `LOAD_SHEDDER`, using `__` for nesting:
//!
//! - `LOAD_SHEDDER__WORKERS=16` -> `workers = 16`
//! - `LOAD_SHEDDER__SERVER__DRAIN_TIMEOUT_MS=500` -> `server.drain_timeout_ms = 500`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ShedderError};
use crate::limiter;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "LOAD_SHEDDER";

/// Upper bound on `workers`, which also sizes the limiter and the
/// connection queue.
pub const MAX_WORKERS: usize = 65_536;

/// Main configuration for the load shedder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShedderConfig {
    /// Master switch for admission control
    #[serde(default)]
    pub enabled: bool,

    /// Filesystem path of the daemon's Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Worker pool size, also the limiter's initial (and maximum) limit
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Completions slower than this are treated as congestion
    #[serde(default = "default_target_p95_ms")]
    pub target_p95_ms: u64,

    /// AIMD tuning
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Daemon socket server
    #[serde(default)]
    pub server: ServerConfig,

    /// Daemon client
    #[serde(default)]
    pub client: ClientConfig,

    /// HTTP middleware
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

impl Default for ShedderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: default_socket_path(),
            workers: default_workers(),
            target_p95_ms: default_target_p95_ms(),
            limiter: LimiterConfig::default(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            middleware: MiddlewareConfig::default(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("tmp/sockets/load_shedder.sock")
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_target_p95_ms() -> u64 {
    300
}

/// AIMD controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Amount added to the limit on a healthy sample near saturation
    #[serde(default = "default_additive_step")]
    pub additive_step: u32,

    /// Factor applied to the limit on a slow sample
    #[serde(default = "default_multiplicative_decrease")]
    pub multiplicative_decrease: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            additive_step: default_additive_step(),
            multiplicative_decrease: default_multiplicative_decrease(),
        }
    }
}

fn default_additive_step() -> u32 {
    limiter::ADDITIVE_STEP
}

fn default_multiplicative_decrease() -> f64 {
    limiter::MULTIPLICATIVE_DECREASE
}

/// Socket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// How long shutdown waits for workers before force-closing connections
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Longest request line accepted before the connection is dropped
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

fn default_max_line_bytes() -> usize {
    1024
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound on a single connection attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    100
}

/// HTTP middleware configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Value of the `Retry-After` header on busy responses
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,

    /// Minimum spacing between repeated warnings of the same kind
    #[serde(default = "default_warn_interval_secs")]
    pub warn_interval_secs: u64,

    /// Requests under these prefixes release their slot without tuning the limit
    #[serde(default = "default_unsampled_path_prefixes")]
    pub unsampled_path_prefixes: Vec<String>,

    /// Cookie whose presence marks a request as authenticated
    #[serde(default = "default_auth_cookie")]
    pub auth_cookie: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            retry_after_secs: default_retry_after_secs(),
            warn_interval_secs: default_warn_interval_secs(),
            unsampled_path_prefixes: default_unsampled_path_prefixes(),
            auth_cookie: default_auth_cookie(),
        }
    }
}

fn default_retry_after_secs() -> u64 {
    2
}

fn default_warn_interval_secs() -> u64 {
    60
}

fn default_unsampled_path_prefixes() -> Vec<String> {
    vec!["/message-bus/".to_string()]
}

fn default_auth_cookie() -> String {
    "_t".to_string()
}

impl ShedderConfig {
    /// Load configuration from an optional file and the environment.
    ///
    /// Environment variables take precedence over file values. The result is
    /// validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: ShedderConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ShedderError::Config("workers must be at least 1".into()));
        }
        if self.workers > MAX_WORKERS {
            return Err(ShedderError::Config(format!(
                "workers must be at most {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.target_p95_ms == 0 {
            return Err(ShedderError::Config(
                "target_p95_ms must be greater than 0".into(),
            ));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(ShedderError::Config("socket_path must not be empty".into()));
        }
        if self.limiter.additive_step == 0 {
            return Err(ShedderError::Config(
                "limiter.additive_step must be at least 1".into(),
            ));
        }
        let decrease = self.limiter.multiplicative_decrease;
        if !(decrease > 0.0 && decrease < 1.0) {
            return Err(ShedderError::Config(format!(
                "limiter.multiplicative_decrease must be in (0, 1), got {}",
                decrease
            )));
        }
        if self.server.max_line_bytes < 16 {
            return Err(ShedderError::Config(
                "server.max_line_bytes must be at least 16".into(),
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.server.drain_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.client.connect_timeout_ms)
    }

    pub fn warn_interval(&self) -> Duration {
        Duration::from_secs(self.middleware.warn_interval_secs)
    }
}
