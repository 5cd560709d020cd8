use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use skyport_locker::{
    Actuator, ActuatorConfig, AppState, CellManager, CellRegistry, Config, HttpOrchestrator,
    MockActuator, Orchestrator, PickupService, ScannerConfig, StdinScanSource, router,
    run_scanner,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "skyport-locker")]
#[command(about = "Skyport locker agent")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "skyport-locker.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,skyport_locker=info".to_owned());
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
        orchestrator = %config.orchestrator.base_url,
        automat_id = ?config.locker.automat_id,
        "Starting skyport-locker"
    );

    let cancel = CancellationToken::new();

    match &config.actuator {
        ActuatorConfig::Mock {
            cell_count,
            internal_count,
            faulty_cells,
        } => {
            info!(cell_count, internal_count, "Using mock actuator");
            let actuator =
                MockActuator::new(*cell_count, *internal_count).with_faulty(faulty_cells.clone());
            run_agent(config, actuator, cancel).await
        }
    }
}

async fn run_agent<A: Actuator>(
    config: Config,
    actuator: A,
    cancel: CancellationToken,
) -> color_eyre::Result<()> {
    let orchestrator = Arc::new(HttpOrchestrator::new(
        config.orchestrator.base_url.clone(),
        config.orchestrator.timeout(),
        config.orchestrator.retry_policy(),
        cancel.clone(),
    )?);

    let cells = CellManager::new(CellRegistry::new(), Arc::new(actuator));
    let pickup = PickupService::new(cells.clone(), orchestrator.clone());

    // The mapping lives in memory only; ask the orchestrator to push it again.
    if let Some(automat_id) = config.locker.automat_id {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.request_sync(automat_id).await {
                Ok(()) => info!(%automat_id, "Requested cell mapping re-sync"),
                Err(e) => warn!(%automat_id, error = %e, "Cell mapping re-sync request failed"),
            }
        });
    }

    let scanner_handle = match config.scanner {
        ScannerConfig::Disabled => None,
        ScannerConfig::Stdin => {
            info!("Reading scans from stdin");
            let pickup = pickup.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                run_scanner(pickup, StdinScanSource::new(), cancel).await;
            }))
        }
    };

    let app = router(AppState { cells, pickup });
    let http_addr = config.server.http_addr;
    let listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    let server = tokio::spawn(async move {
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
    if tokio::time::timeout(grace, server).await.is_err() {
        warn!(grace_secs = config.shutdown_grace_secs, "HTTP server did not drain in time");
    }
    if let Some(handle) = scanner_handle {
        // Stdin reads are not cancellable; do not wait on them.
        handle.abort();
    }

    info!("skyport-locker shut down complete");
    Ok(())
}
