use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use load_shedder::client::AdmissionClient;
use load_shedder::config::ShedderConfig;
use load_shedder::server::AdmissionServer;

#[derive(Debug, Parser)]
#[command(name = "load-shedder", version, about = "Adaptive admission control daemon")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, global = true, env = "LOAD_SHEDDER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the admission daemon
    Serve {
        /// Unix socket to listen on
        #[arg(long)]
        socket_path: Option<PathBuf>,

        /// Worker pool size and initial concurrency limit
        #[arg(long)]
        workers: Option<usize>,

        /// Latency above which a completion counts as slow
        #[arg(long)]
        target_p95_ms: Option<u64>,
    },
    /// Print the running daemon's limiter state
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = ShedderConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            socket_path,
            workers,
            target_p95_ms,
        } => {
            if let Some(socket_path) = socket_path {
                config.socket_path = socket_path;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(target_p95_ms) = target_p95_ms {
                config.target_p95_ms = target_p95_ms;
            }
            config.validate()?;
            serve(config).await
        }
        Command::Stats => {
            let stats = AdmissionClient::from_config(&config).stats().await?;
            println!(
                "limit={} inflight={} degraded={}",
                stats.limit,
                stats.inflight,
                u8::from(stats.degraded)
            );
            Ok(())
        }
    }
}

async fn serve(config: ShedderConfig) -> anyhow::Result<()> {
    info!("Starting Load Shedder admission daemon");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let server = AdmissionServer::bind(&config).map_err(|e| {
        error!(error = %e, "Failed to start admission daemon");
        e
    })?;
    info!(
        socket = %server.socket_path().display(),
        workers = config.workers,
        target_p95_ms = config.target_p95_ms,
        "Configuration loaded"
    );

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Load Shedder admission daemon stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("load_shedder=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
