use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use jiff::Timestamp;
use serde::Serialize;
use skyport_core::telemetry::{DroneCommand, DroneReport};
use skyport_core::{DeliveryId, DeliveryTask, DroneId, DroneStatus, OrderId, Position};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Outbound commands buffered per connection.
const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("drone {0} is not connected")]
    NotConnected(DroneId),
    #[error("connection of drone {0} closed")]
    Closed(DroneId),
    #[error("command queue of drone {0} is full")]
    Backlogged(DroneId),
}

/// A live telemetry connection as seen by its handler.
pub struct Session {
    pub id: u64,
    pub commands: mpsc::Receiver<DroneCommand>,
}

/// A task fetched from the orchestrator that has not reached its drone yet.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task: DeliveryTask,
    /// Dispatch attempts made so far.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
struct ActiveTask {
    task: DeliveryTask,
    in_transit_reported: bool,
}

#[derive(Default)]
struct DroneEntry {
    session: Option<u64>,
    commands: Option<mpsc::Sender<DroneCommand>>,
    status: Option<DroneStatus>,
    report: Option<DroneReport>,
    last_seen: Option<Timestamp>,
    task: Option<ActiveTask>,
    video_frames: u64,
}

/// Externally visible state of one drone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroneView {
    pub drone_id: DroneId,
    pub connected: bool,
    pub status: Option<DroneStatus>,
    pub battery_level: Option<f32>,
    pub position: Option<Position>,
    pub last_seen: Option<Timestamp>,
    pub delivery_id: Option<DeliveryId>,
    pub order_id: Option<OrderId>,
    pub video_frames: u64,
}

/// Shared state of every drone that has connected since startup, plus the
/// tasks still waiting for theirs.
#[derive(Clone, Default)]
pub struct Fleet {
    drones: Arc<DashMap<DroneId, DroneEntry>>,
    pending: Arc<DashMap<DeliveryId, PendingTask>>,
    sessions: Arc<AtomicU64>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `drone_id`, superseding any earlier one.
    pub fn connect(&self, drone_id: DroneId) -> Session {
        let id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let mut entry = self.drones.entry(drone_id).or_default();
        if entry.session.is_some() {
            warn!(%drone_id, "Drone reconnected, replacing previous connection");
        }
        entry.session = Some(id);
        entry.commands = Some(tx);
        entry.last_seen = Some(Timestamp::now());

        Session { id, commands: rx }
    }

    /// Drop the connection `session` of `drone_id`. A newer connection is left alone.
    pub fn disconnect(&self, drone_id: DroneId, session: u64) {
        let Some(mut entry) = self.drones.get_mut(&drone_id) else {
            return;
        };
        if entry.session == Some(session) {
            entry.session = None;
            entry.commands = None;
            info!(%drone_id, "Drone disconnected");
        }
    }

    pub fn is_connected(&self, drone_id: DroneId) -> bool {
        self.drones
            .get(&drone_id)
            .is_some_and(|entry| entry.session.is_some())
    }

    pub fn record_report(&self, drone_id: DroneId, report: DroneReport) {
        let mut entry = self.drones.entry(drone_id).or_default();
        entry.status = Some(report.status);
        entry.last_seen = Some(Timestamp::now());
        entry.report = Some(report);
    }

    pub fn record_status(&self, drone_id: DroneId, status: DroneStatus) {
        let mut entry = self.drones.entry(drone_id).or_default();
        entry.status = Some(status);
        entry.last_seen = Some(Timestamp::now());
    }

    pub fn record_video_frame(&self, drone_id: DroneId) {
        let mut entry = self.drones.entry(drone_id).or_default();
        entry.video_frames += 1;
        entry.last_seen = Some(Timestamp::now());
    }

    /// Queue `command` on the drone's connection without waiting. The
    /// connection task itself sends commands, so this must never block.
    pub fn send(&self, drone_id: DroneId, command: DroneCommand) -> Result<(), FleetError> {
        let entry = self
            .drones
            .get(&drone_id)
            .ok_or(FleetError::NotConnected(drone_id))?;
        let sender = entry
            .commands
            .as_ref()
            .ok_or(FleetError::NotConnected(drone_id))?;

        sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FleetError::Backlogged(drone_id),
            mpsc::error::TrySendError::Closed(_) => FleetError::Closed(drone_id),
        })
    }

    /// Remember `task` as the one its drone is flying.
    pub fn assign(&self, task: DeliveryTask) {
        let mut entry = self.drones.entry(task.drone_id).or_default();
        entry.task = Some(ActiveTask {
            task,
            in_transit_reported: false,
        });
    }

    pub fn active_task(&self, drone_id: DroneId) -> Option<DeliveryTask> {
        self.drones
            .get(&drone_id)
            .and_then(|entry| entry.task.as_ref().map(|active| active.task.clone()))
    }

    /// Returns `true` only the first time the active delivery `delivery_id` is
    /// reported in transit.
    pub fn mark_in_transit(&self, drone_id: DroneId, delivery_id: DeliveryId) -> bool {
        let Some(mut entry) = self.drones.get_mut(&drone_id) else {
            return false;
        };
        match entry.task.as_mut() {
            Some(active) if active.task.delivery_id == delivery_id => {
                !std::mem::replace(&mut active.in_transit_reported, true)
            }
            _ => false,
        }
    }

    /// Forget the active task of `drone_id` if it belongs to `order_id`.
    pub fn finish_order(&self, drone_id: DroneId, order_id: OrderId) -> Option<DeliveryTask> {
        let mut entry = self.drones.get_mut(&drone_id)?;
        let owned = entry
            .task
            .as_ref()
            .is_some_and(|active| active.task.order_id == order_id);
        if !owned {
            return None;
        }
        entry.task.take().map(|active| active.task)
    }

    /// Find and forget the active task for `delivery_id`, returning its drone.
    pub fn finish_delivery(&self, delivery_id: DeliveryId) -> Option<DroneId> {
        for mut entry in self.drones.iter_mut() {
            if entry
                .task
                .as_ref()
                .is_some_and(|active| active.task.delivery_id == delivery_id)
            {
                entry.task = None;
                return Some(*entry.key());
            }
        }
        None
    }

    /// Hold `task` until its drone can take it. Already queued deliveries are kept as is.
    pub fn queue(&self, task: DeliveryTask) {
        self.pending
            .entry(task.delivery_id)
            .or_insert(PendingTask { task, attempts: 0 });
    }

    pub fn pending(&self) -> Vec<PendingTask> {
        let mut pending: Vec<PendingTask> =
            self.pending.iter().map(|entry| entry.value().clone()).collect();
        pending.sort_by_key(|p| p.task.delivery_id);
        pending
    }

    pub fn remove_pending(&self, delivery_id: DeliveryId) -> Option<PendingTask> {
        self.pending.remove(&delivery_id).map(|(_, pending)| pending)
    }

    /// Count one more failed dispatch attempt and return the new total.
    pub fn bump_pending(&self, delivery_id: DeliveryId) -> u32 {
        match self.pending.get_mut(&delivery_id) {
            Some(mut pending) => {
                pending.attempts += 1;
                pending.attempts
            }
            None => 0,
        }
    }

    pub fn get(&self, drone_id: DroneId) -> Option<DroneView> {
        self.drones
            .get(&drone_id)
            .map(|entry| view(drone_id, &entry))
    }

    pub fn snapshot(&self) -> Vec<DroneView> {
        let mut drones: Vec<DroneView> = self
            .drones
            .iter()
            .map(|entry| view(*entry.key(), entry.value()))
            .collect();
        drones.sort_by_key(|d| d.drone_id);
        drones
    }
}

fn view(drone_id: DroneId, entry: &DroneEntry) -> DroneView {
    let task = entry.task.as_ref().map(|active| &active.task);
    DroneView {
        drone_id,
        connected: entry.session.is_some(),
        status: entry.status,
        battery_level: entry.report.as_ref().map(|r| r.battery_level),
        position: entry.report.as_ref().map(|r| r.position),
        last_seen: entry.last_seen,
        delivery_id: task.map(|t| t.delivery_id),
        order_id: task.map(|t| t.order_id),
        video_frames: entry.video_frames,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyport_core::{AutomatId, CellId, Dimensions, GoodId};

    fn task(drone_id: DroneId) -> DeliveryTask {
        DeliveryTask {
            delivery_id: DeliveryId::new(),
            order_id: OrderId::new(),
            good_id: GoodId::new(),
            drone_id,
            parcel_automat_id: AutomatId::new(),
            aruco_id: 4,
            locker_cell_id: CellId::new(),
            internal_locker_cell_id: None,
            dimensions: Dimensions::new(100, 100, 100),
        }
    }

    #[tokio::test]
    async fn stale_session_does_not_disconnect_newer_one() {
        let fleet = Fleet::new();
        let drone = DroneId::new();

        let first = fleet.connect(drone);
        let mut second = fleet.connect(drone);
        fleet.disconnect(drone, first.id);
        assert!(fleet.is_connected(drone));

        fleet
            .send(
                drone,
                DroneCommand::CancelDelivery {
                    delivery_id: DeliveryId::new(),
                },
            )
            .unwrap();
        assert!(second.commands.recv().await.is_some());

        fleet.disconnect(drone, second.id);
        assert!(!fleet.is_connected(drone));
    }

    #[test]
    fn send_to_unknown_drone_fails() {
        let fleet = Fleet::new();
        let drone = DroneId::new();
        let err = fleet
            .send(
                drone,
                DroneCommand::CancelDelivery {
                    delivery_id: DeliveryId::new(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, FleetError::NotConnected(id) if id == drone));
    }

    #[test]
    fn in_transit_is_reported_once() {
        let fleet = Fleet::new();
        let drone = DroneId::new();
        let t = task(drone);
        fleet.assign(t.clone());

        assert!(fleet.mark_in_transit(drone, t.delivery_id));
        assert!(!fleet.mark_in_transit(drone, t.delivery_id));
        assert!(!fleet.mark_in_transit(drone, DeliveryId::new()));
    }

    #[test]
    fn queue_keeps_attempt_count_of_known_task() {
        let fleet = Fleet::new();
        let t = task(DroneId::new());
        fleet.queue(t.clone());
        assert_eq!(fleet.bump_pending(t.delivery_id), 1);

        fleet.queue(t.clone());
        assert_eq!(fleet.pending()[0].attempts, 1);
        assert_eq!(fleet.remove_pending(t.delivery_id).map(|p| p.attempts), Some(1));
        assert_eq!(fleet.bump_pending(t.delivery_id), 0);
    }

    #[test]
    fn finishing_an_order_clears_the_view() {
        let fleet = Fleet::new();
        let drone = DroneId::new();
        let t = task(drone);
        fleet.assign(t.clone());
        assert_eq!(fleet.get(drone).unwrap().order_id, Some(t.order_id));

        assert!(fleet.finish_order(drone, OrderId::new()).is_none());
        assert_eq!(fleet.finish_order(drone, t.order_id), Some(t));
        assert_eq!(fleet.get(drone).unwrap().delivery_id, None);
    }
}
