use std::sync::Arc;

use jiff::Timestamp;
use skyport_core::telemetry::{DroneCommand, DroneMessage, DroneReport};
use skyport_core::{
    AutomatId, CellId, CellOpenRequest, DeliveryEvent, DeliveryEventRequest, DroneId,
    DroneStatus, DroneStatusReport, OrderId,
};
use tracing::{debug, error, info, instrument, warn};

use crate::fleet::Fleet;
use crate::link::OrchestratorLink;

/// Reacts to telemetry frames: keeps the fleet state current and drives the
/// delivery protocol with the orchestrator.
#[derive(Clone)]
pub struct DeliveryHandler {
    fleet: Fleet,
    link: Arc<OrchestratorLink>,
    base_marker_id: u32,
}

impl DeliveryHandler {
    pub fn new(fleet: Fleet, link: Arc<OrchestratorLink>, base_marker_id: u32) -> Self {
        Self {
            fleet,
            link,
            base_marker_id,
        }
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn link(&self) -> &Arc<OrchestratorLink> {
        &self.link
    }

    pub async fn handle(&self, drone_id: DroneId, message: DroneMessage) {
        match message {
            DroneMessage::Hello { drone_id: claimed } => {
                warn!(%drone_id, %claimed, "Ignoring repeated hello");
            }
            DroneMessage::Heartbeat(report) => {
                debug!(%drone_id, status = %report.status, "heartbeat");
                self.on_report(drone_id, report).await;
            }
            DroneMessage::StatusUpdate(report) => {
                info!(%drone_id, status = %report.status, battery = report.battery_level, "status update");
                if let Some(reason) = &report.error_message {
                    warn!(%drone_id, reason = %reason, "Drone reported an error");
                }
                self.on_report(drone_id, report).await;
            }
            DroneMessage::DeliveryUpdate {
                drone_status,
                delivery_id,
                order_id,
                ..
            } => {
                self.fleet.record_status(drone_id, drone_status);
                if drone_status == DroneStatus::InTransit
                    && self.fleet.mark_in_transit(drone_id, delivery_id)
                {
                    self.report(drone_id, order_id, DeliveryEvent::InTransit).await;
                }
            }
            DroneMessage::ArrivedAtDestination {
                order_id,
                parcel_automat_id,
            } => {
                // Opening may take several retries; keep reading telemetry meanwhile.
                let handler = self.clone();
                tokio::spawn(async move {
                    handler.on_arrival(drone_id, order_id, parcel_automat_id).await;
                });
            }
            DroneMessage::CargoDropped {
                order_id,
                locker_cell_id,
            } => self.on_cargo_dropped(drone_id, order_id, locker_cell_id).await,
            DroneMessage::VideoFrame(_) => self.fleet.record_video_frame(drone_id),
        }
    }

    async fn on_report(&self, drone_id: DroneId, report: DroneReport) {
        let forwarded = DroneStatusReport {
            drone_id,
            status: report.status,
            battery_level: report.battery_level,
            timestamp: Timestamp::now(),
        };
        self.fleet.record_report(drone_id, report);

        if let Err(e) = self.link.drone_status(forwarded).await {
            warn!(%drone_id, error = %e, "Failed to forward drone status");
        }
    }

    /// Ask the orchestrator to open the drop-off cell and tell the drone where
    /// to release the parcel. A cell that cannot be opened fails the delivery.
    #[instrument(skip_all, fields(%drone_id, %order_id))]
    pub async fn on_arrival(&self, drone_id: DroneId, order_id: OrderId, automat_id: AutomatId) {
        let request = CellOpenRequest {
            order_id,
            parcel_automat_id: automat_id,
        };

        let failure = match self.link.cell_open(request).await {
            Ok(response) => match response.cell_id {
                Some(cell_id) if response.success => {
                    info!(%cell_id, "Cell opened, dropping cargo");
                    let command = DroneCommand::DropCargo {
                        order_id,
                        cell_id,
                        internal_cell_id: response.internal_cell_id,
                    };
                    match self.fleet.send(drone_id, command) {
                        Ok(()) => return,
                        Err(e) => e.to_string(),
                    }
                }
                _ => format!("cell open refused: {}", response.message),
            },
            Err(e) if e.is_cancelled() => return,
            Err(e) => e.to_string(),
        };

        error!(reason = %failure, "Drop-off failed, sending drone back");
        self.report(drone_id, order_id, DeliveryEvent::Failed {
            reason: failure.into(),
        })
        .await;
        self.return_to_base(drone_id, order_id).await;
    }

    async fn on_cargo_dropped(
        &self,
        drone_id: DroneId,
        order_id: OrderId,
        locker_cell_id: Option<CellId>,
    ) {
        info!(%drone_id, %order_id, "Cargo dropped");
        self.report(drone_id, order_id, DeliveryEvent::CargoDropped { locker_cell_id })
            .await;
        self.return_to_base(drone_id, order_id).await;
    }

    async fn return_to_base(&self, drone_id: DroneId, order_id: OrderId) {
        let delivery_id = self
            .fleet
            .finish_order(drone_id, order_id)
            .map(|task| task.delivery_id);
        let command = DroneCommand::ReturnToBase {
            delivery_id,
            base_marker_id: self.base_marker_id,
        };
        if let Err(e) = self.fleet.send(drone_id, command) {
            warn!(%drone_id, error = %e, "Could not send return to base");
        }
    }

    /// Tell the orchestrator about delivery progress. Failures are logged; the
    /// drone keeps flying either way.
    pub async fn report(&self, drone_id: DroneId, order_id: OrderId, event: DeliveryEvent) {
        let request = DeliveryEventRequest {
            order_id,
            drone_id,
            event,
        };
        match self.link.delivery_event(request).await {
            Ok(response) => {
                info!(%drone_id, %order_id, order_status = %response.order_status, "Delivery event accepted");
            }
            Err(e) => error!(%drone_id, %order_id, error = %e, "Delivery event was not recorded"),
        }
    }
}
