use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use skyport_orchestrator::config::DEFAULT_SECRET;
use skyport_orchestrator::{
    AppState, Config, Coordinator, HttpLockerAgent, MemoryStore, SqliteStore, StorageConfig, Store,
    TokenAuthority, api, rpc, worker,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "skyport-orchestrator")]
#[command(about = "Skyport order and delivery orchestrator")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "skyport-orchestrator.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,skyport_orchestrator=info,skyport_rpc=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(
        http_addr = %config.server.http_addr,
        rpc_addr = %config.server.rpc_addr,
        "Starting skyport-orchestrator"
    );

    if config.tokens.secret == DEFAULT_SECRET {
        warn!("Using the built-in token secret; set [tokens].secret for any shared deployment");
    }

    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage");
            run_orchestrator(config, MemoryStore::new()).await
        }
        StorageConfig::Sqlite { path } => {
            info!(?path, "Using SQLite storage");
            let store = SqliteStore::new(path).await?;
            run_orchestrator(config, store).await
        }
    }
}

async fn run_orchestrator<S: Store>(config: Config, store: S) -> color_eyre::Result<()> {
    let cancel = CancellationToken::new();

    let tokens = Arc::new(TokenAuthority::new(
        &config.tokens.secret,
        config.tokens.identity_ttl(),
        config.tokens.pickup_ttl(),
    )?);
    let agent = Arc::new(HttpLockerAgent::new(
        config.agent.timeout(),
        config.agent.retry_policy(),
        cancel.clone(),
    )?);
    let coordinator = Coordinator::new(store, agent, tokens, config.automat);

    let rpc_listener = TcpListener::bind(config.server.rpc_addr).await?;
    info!(rpc_addr = %config.server.rpc_addr, "RPC server listening");
    let rpc_server = rpc::server(rpc_listener, coordinator.clone());
    let rpc_handle = tokio::spawn(rpc_server.serve(cancel.clone()));

    let worker_handle = tokio::spawn(worker::run_assignment(
        coordinator.clone(),
        Duration::from_secs(config.worker.assign_interval_secs.max(1)),
        cancel.clone(),
    ));

    let app = api::app(AppState { coordinator });
    let http_addr = config.server.http_addr;
    let listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    let http_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel_for_http.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = ?e, "HTTP server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let drained = tokio::time::timeout(grace, async {
        let _ = tokio::join!(http_handle, rpc_handle, worker_handle);
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = config.shutdown_grace_secs, "Tasks did not drain in time");
    }

    info!("skyport-orchestrator shut down complete");
    Ok(())
}
