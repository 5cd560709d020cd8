use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use skyport_drone::{
    Config, DeliveryHandler, Fleet, OrchestratorLink, TaskDispatcher, TelemetryServer, router,
    run_dispatcher,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "skyport-drone")]
#[command(about = "Skyport drone control service")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "skyport-drone.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,skyport_drone=info".to_owned());
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
        telemetry_addr = %config.server.telemetry_addr,
        http_addr = %config.server.http_addr,
        orchestrator = %config.orchestrator.rpc_addr,
        "Starting skyport-drone"
    );

    let cancel = CancellationToken::new();

    let link = Arc::new(OrchestratorLink::new(
        config.orchestrator.rpc_addr,
        config.orchestrator.timeout(),
        config.orchestrator.retry_policy(),
        cancel.clone(),
    ));
    let fleet = Fleet::new();
    let handler = DeliveryHandler::new(fleet.clone(), link, config.dispatch.base_marker_id);

    let telemetry = TelemetryServer::bind(config.server.telemetry_addr, handler.clone()).await?;
    let telemetry_handle = tokio::spawn(telemetry.serve(cancel.clone()));

    let dispatcher = TaskDispatcher::new(
        handler,
        config.dispatch.max_tasks,
        config.dispatch.max_dispatch_attempts,
    );
    let dispatcher_handle = tokio::spawn(run_dispatcher(
        dispatcher,
        config.dispatch.poll_interval(),
        cancel.clone(),
    ));

    let http_addr = config.server.http_addr;
    let listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router(fleet))
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
        let _ = tokio::join!(server, telemetry_handle, dispatcher_handle);
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = config.shutdown_grace_secs, "Tasks did not drain in time");
    }

    info!("skyport-drone shut down complete");
    Ok(())
}
