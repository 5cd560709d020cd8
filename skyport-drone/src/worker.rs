use std::time::Duration;

use skyport_core::telemetry::DroneCommand;
use skyport_core::{CancelledDelivery, DeliveryEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::DeliveryHandler;

/// Moves work from the orchestrator's task queue onto drone connections.
pub struct TaskDispatcher {
    handler: DeliveryHandler,
    max_tasks: u32,
    max_attempts: u32,
}

impl TaskDispatcher {
    pub fn new(handler: DeliveryHandler, max_tasks: u32, max_attempts: u32) -> Self {
        Self {
            handler,
            max_tasks,
            max_attempts,
        }
    }

    /// One poll of the orchestrator followed by a dispatch pass over every
    /// task still waiting for its drone.
    pub async fn tick(&self) {
        match self.handler.link().poll_tasks(self.max_tasks).await {
            Ok(response) => {
                if !response.tasks.is_empty() {
                    info!(count = response.tasks.len(), "Received delivery tasks");
                }
                for task in response.tasks.into_vec() {
                    self.handler.fleet().queue(task);
                }
                for cancelled in response.cancelled.iter() {
                    self.cancel(cancelled);
                }
            }
            Err(e) if e.is_cancelled() => return,
            Err(e) => warn!(error = %e, "Task poll failed"),
        }

        self.dispatch_pending().await;
    }

    fn cancel(&self, cancelled: &CancelledDelivery) {
        let fleet = self.handler.fleet();
        let delivery_id = cancelled.delivery_id;

        if fleet.remove_pending(delivery_id).is_some() {
            info!(%delivery_id, "Dropped cancelled task before dispatch");
            return;
        }

        let drone_id = fleet
            .finish_delivery(delivery_id)
            .unwrap_or(cancelled.drone_id);
        match fleet.send(drone_id, DroneCommand::CancelDelivery { delivery_id }) {
            Ok(()) => info!(%delivery_id, %drone_id, "Delivery cancelled"),
            Err(e) => warn!(%delivery_id, %drone_id, error = %e, "Could not forward cancellation"),
        }
    }

    async fn dispatch_pending(&self) {
        let fleet = self.handler.fleet();

        for pending in fleet.pending() {
            let task = pending.task;
            let delivery_id = task.delivery_id;
            let drone_id = task.drone_id;

            match fleet.send(drone_id, DroneCommand::StartDelivery(task.clone())) {
                Ok(()) => {
                    fleet.remove_pending(delivery_id);
                    fleet.assign(task);
                    info!(%delivery_id, %drone_id, "Delivery started");
                    continue;
                }
                Err(e) => debug!(%delivery_id, %drone_id, error = %e, "Task not dispatched yet"),
            }

            let attempts = fleet.bump_pending(delivery_id);
            if attempts < self.max_attempts {
                continue;
            }

            error!(%delivery_id, %drone_id, attempts, "Drone never took the task, failing delivery");
            fleet.remove_pending(delivery_id);
            self.handler
                .report(
                    drone_id,
                    task.order_id,
                    DeliveryEvent::Failed {
                        reason: format!("drone {drone_id} unreachable after {attempts} attempts")
                            .into(),
                    },
                )
                .await;
        }
    }
}

/// Poll for tasks every `interval` until cancelled.
pub async fn run_dispatcher(
    dispatcher: TaskDispatcher,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Task dispatcher shutting down");
                break;
            }
            _ = ticker.tick() => dispatcher.tick().await,
        }
    }
}
