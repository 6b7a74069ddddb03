mod concurrency;
mod config;
mod copydriver;
mod db;
mod engine;
mod error;
mod events;
mod glob;
mod keymaterial;
mod models;
mod progress;
mod queue;
mod recovery;
mod routes;
mod scanner;
mod scheduler;
mod ssh;
mod statemanager;
mod walker;
mod ws;

use clap::{Parser, Subcommand};
use tokio::signal;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::engine::Engine;

#[derive(Parser)]
#[command(name = "warpsync", about = "Background directory-tree synchronization daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default if no subcommand is given).
    Run,
    /// Run the recovery boot sequence once and exit.
    Recover,
    /// Force every non-terminal FileRecord back to `remote_only`.
    EmergencyReset,
    /// Check copy-tool/SSH presence and configuration validity, then exit.
    ValidateSystem,
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    init_logging(&config.log_level);

    let exit_code = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Recover => recover(config).await,
        Command::EmergencyReset => emergency_reset(config).await,
        Command::ValidateSystem => validate_system(config).await,
    };

    std::process::exit(exit_code);
}

fn open_store(config: &AppConfig) -> anyhow::Result<crate::db::connection::DbPool> {
    if let Some(parent) = config.store_uri.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pool = create_pool(&config.store_uri);
    migrate(&pool)?;
    Ok(pool)
}

async fn run(config: AppConfig) -> i32 {
    let pool = match open_store(&config) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to open store");
            return 2;
        }
    };

    let engine = Engine::new(config.clone(), pool);
    tracing::info!(bind_port = config.bind_port, "starting warpsync");

    if let Err(e) = engine.run().await {
        tracing::error!(error = %e, "engine failed to start");
        return 2;
    }

    let app = routes::create_router(engine.clone());
    let addr = format!("0.0.0.0:{}", config.bind_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind listener");
            engine.shutdown().await;
            return 2;
        }
    };
    tracing::info!(%addr, "listening");

    let cancel = engine.cancellation_token();
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(cancel)).await {
        tracing::error!(error = %e, "server error");
    }

    tracing::info!("shutting down");
    engine.shutdown().await;
    0
}

async fn recover(config: AppConfig) -> i32 {
    let pool = match open_store(&config) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to open store");
            return 2;
        }
    };
    let engine = Engine::new(config, pool);
    match engine.recovery.run_boot_sequence().await {
        Ok(counters) => {
            tracing::info!(?counters, "recovery complete");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "recovery failed");
            1
        }
    }
}

async fn emergency_reset(config: AppConfig) -> i32 {
    let pool = match open_store(&config) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to open store");
            return 2;
        }
    };
    let engine = Engine::new(config, pool);
    match engine.recovery.emergency_reset() {
        Ok(count) => {
            tracing::info!(reset = count, "emergency reset complete");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "emergency reset failed");
            1
        }
    }
}

async fn validate_system(config: AppConfig) -> i32 {
    let mut ok = true;
    for bin in ["rsync", "ssh"] {
        match which::which(bin) {
            Ok(path) => tracing::info!(%bin, path = %path.display(), "found"),
            Err(_) => {
                tracing::error!(%bin, "not found on PATH");
                ok = false;
            }
        }
    }
    if config.bind_port == 0 {
        tracing::error!("BIND_PORT must not be 0");
        ok = false;
    }
    if config.max_global_concurrent_processes == 0 {
        tracing::error!("MAX_GLOBAL_CONCURRENT_PROCESSES must be > 0");
        ok = false;
    }
    if ok {
        tracing::info!("configuration valid");
        0
    } else {
        3
    }
}

async fn shutdown_signal(cancel: tokio_util::sync::CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    cancel.cancel();
}
