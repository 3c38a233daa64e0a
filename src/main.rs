use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::engine::Engine;
use turnstile::quota::RouteQuotas;

/// How often `watch` logs the engine state.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "turnstile", version, about = "Adaptive admission control operator tool")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON); TURNSTILE__* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then print it
    Validate,
    /// Fetch route quotas once and print the refresh report
    Refresh,
    /// Run the background tasks and log engine state until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Turnstile starting");

    match cli.command {
        Command::Validate => {
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Refresh => {
            let quotas = RouteQuotas::new(&config.quotas)?;
            let report = quotas.refresh_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Watch => watch(&config).await?,
    }
    Ok(())
}

async fn watch(config: &TurnstileConfig) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::from_config(config)?);
    let shutdown = CancellationToken::new();
    let handles = engine.start(shutdown.clone());

    let status = {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let stats = engine.adaptive_stats();
                        info!(
                            quota_routes = engine.quotas().map(|q| q.len()).unwrap_or(0),
                            utilization = stats.utilization,
                            in_flight = stats.in_flight,
                            max_in_flight = stats.max_in_flight,
                            dropped = stats.dropped,
                            "Engine status"
                        );
                    }
                }
            }
        })
    };

    shutdown_signal().await;
    shutdown.cancel();
    engine.stop();

    for handle in handles.into_iter().chain(std::iter::once(status)) {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task failed");
        }
    }
    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
