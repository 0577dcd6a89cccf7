//! warmpoold — the warmpool daemon.
//!
//! Single binary that assembles the pool:
//! - Configuration (`warmpool.toml` plus a directory of `process.toml` files)
//! - Pool coordinator and its maintenance loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! warmpoold run --config /etc/warmpool/warmpool.toml --port 8080
//! warmpoold healthcheck --config /etc/warmpool/warmpool.toml --configuration 5.47.0
//! ```

mod healthcheck;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use warmpool_api::{ApiState, build_router};
use warmpool_coordinator::PoolCoordinator;
use warmpool_core::WarmpoolConfig;
use warmpool_runtime::OsSpawner;

#[derive(Parser)]
#[command(name = "warmpoold", about = "Warm interpreter pool daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep pools warm and serve the HTTP API until interrupted.
    Run {
        /// Daemon configuration file.
        #[arg(long, default_value = "warmpool.toml")]
        config: PathBuf,

        /// Address to bind.
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Start one process, run a trivial command, and report timings.
    Healthcheck {
        #[arg(long, default_value = "warmpool.toml")]
        config: PathBuf,

        /// Configuration to check; defaults to the best match among those
        /// available.
        #[arg(long)]
        configuration: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run { config, bind, port } => run_daemon(config, SocketAddr::new(bind, port)).await,
        Command::Healthcheck {
            config,
            configuration,
        } => healthcheck::run(&config, configuration.as_deref()).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,warmpool=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_daemon(config_path: PathBuf, addr: SocketAddr) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "warmpool daemon starting");

    // ── Configuration ──────────────────────────────────────────

    let source = WarmpoolConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let settings = source.clone().resolve()?;
    for (name, value) in settings.describe() {
        debug!(setting = %name, %value, "pool setting");
    }
    info!(
        configurations = settings.configurations.len(),
        "configurations loaded"
    );

    // ── Coordinator ────────────────────────────────────────────

    let coordinator = Arc::new(PoolCoordinator::start(settings, Arc::new(OsSpawner)).await);
    info!(
        running = ?coordinator.running_configurations().await,
        "coordinator started"
    );

    // ── API server ─────────────────────────────────────────────

    let router = build_router(ApiState {
        coordinator: coordinator.clone(),
        config_source: Some(Arc::new(source)),
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API server listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    coordinator.destroy().await;
    served?;
    info!("warmpool daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
