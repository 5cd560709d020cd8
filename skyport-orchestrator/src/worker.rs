use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::LockerAgent;
use crate::coordinator::Coordinator;
use crate::store::Store;

/// Periodically hand deliveries that are waiting for a drone to idle drones.
pub async fn run_assignment<S: Store, A: LockerAgent>(
    coordinator: Coordinator<S, A>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Assignment worker shutting down");
                break;
            }
            _ = ticker.tick() => {
                match coordinator.assign_pending_deliveries().await {
                    Ok(0) => debug!("no deliveries assigned"),
                    Ok(assigned) => info!(assigned, "assigned waiting deliveries"),
                    Err(e) => warn!(error = %e, "assignment pass failed"),
                }
            }
        }
    }
}
