//! The drone service between simulated drones and a fake orchestrator RPC
//! server, all over loopback.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use skyport_core::telemetry::{ControlAction, DroneCommand};
use skyport_core::{
    AutomatId, CancelledDelivery, CellId, CellOpenResponse, DeliveryEvent, DeliveryEventRequest,
    DeliveryEventResponse, DeliveryId, DeliveryTask, Dimensions, DroneId, DroneStatusReport,
    GoodId, OrderId, OrderStatus, PollTasksResponse,
};
use skyport_drone::{DeliveryHandler, Fleet, OrchestratorLink, TaskDispatcher, TelemetryServer};
use skyport_rpc::{CancellationToken, RetryPolicy, Server, WireError, WireErrorCode, WireMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct Recorded {
    events: Vec<DeliveryEventRequest>,
    statuses: Vec<DroneStatusReport>,
    cell_opens: u32,
}

#[derive(Clone, Default)]
struct FakeOrchestrator {
    recorded: Arc<Mutex<Recorded>>,
    tasks: Arc<Mutex<Vec<DeliveryTask>>>,
    cancelled: Arc<Mutex<Vec<CancelledDelivery>>>,
}

impl FakeOrchestrator {
    fn events(&self) -> Vec<DeliveryEventRequest> {
        self.recorded.lock().unwrap().events.clone()
    }

    fn push_task(&self, task: DeliveryTask) {
        self.tasks.lock().unwrap().push(task);
    }

    async fn serve(&self, refuse_open: bool, cancel: CancellationToken) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let opens = self.recorded.clone();
        let events = self.recorded.clone();
        let statuses = self.recorded.clone();
        let tasks = self.tasks.clone();
        let cancelled = self.cancelled.clone();

        let server = Server::new(listener)
            .on_cell_open(move |request| {
                opens.lock().unwrap().cell_opens += 1;
                async move {
                    if refuse_open {
                        return WireMessage::Error(WireError::new(
                            WireErrorCode::NotFound,
                            format!("order {} not found", request.order_id),
                        ));
                    }
                    WireMessage::CellOpenResponse(CellOpenResponse {
                        success: true,
                        message: "opened".into(),
                        cell_id: Some(CellId::new()),
                        internal_cell_id: None,
                    })
                }
            })
            .on_poll_tasks(move |request| {
                let max = request.max as usize;
                let mut queued = tasks.lock().unwrap();
                let take = max.min(queued.len());
                let response = PollTasksResponse {
                    tasks: queued.drain(..take).collect(),
                    cancelled: std::mem::take(&mut *cancelled.lock().unwrap()).into(),
                };
                async move { WireMessage::PollTasksResponse(response) }
            })
            .on_delivery_event(move |request| {
                let order_status = match request.event {
                    DeliveryEvent::InTransit => OrderStatus::InTransit,
                    DeliveryEvent::CargoDropped { .. } => OrderStatus::Delivered,
                    DeliveryEvent::Failed { .. } => OrderStatus::Failed,
                };
                events.lock().unwrap().events.push(request);
                async move {
                    WireMessage::DeliveryEventResponse(DeliveryEventResponse { order_status })
                }
            })
            .on_drone_status(move |report| {
                statuses.lock().unwrap().statuses.push(report);
                async move { WireMessage::DroneStatusAck }
            });

        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve(cancel));
        addr
    }
}

struct Harness {
    orchestrator: FakeOrchestrator,
    handler: DeliveryHandler,
    telemetry: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

const BASE_MARKER: u32 = 99;

async fn start(refuse_open: bool) -> Harness {
    let cancel = CancellationToken::new();
    let orchestrator = FakeOrchestrator::default();
    let rpc_addr = orchestrator.serve(refuse_open, cancel.clone()).await;

    let link = Arc::new(OrchestratorLink::new(
        rpc_addr,
        Duration::from_secs(2),
        RetryPolicy::new(2, Duration::from_millis(10)),
        cancel.clone(),
    ));
    let handler = DeliveryHandler::new(Fleet::new(), link, BASE_MARKER);

    let server = TelemetryServer::bind("127.0.0.1:0".parse().unwrap(), handler.clone())
        .await
        .unwrap();
    let telemetry = server.local_addr().unwrap();
    tokio::spawn(server.serve(cancel.clone()));

    Harness {
        orchestrator,
        handler,
        telemetry,
        cancel,
    }
}

struct SimulatedDrone {
    id: DroneId,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl SimulatedDrone {
    async fn connect(harness: &Harness) -> Self {
        let id = DroneId::new();
        let stream = TcpStream::connect(harness.telemetry).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut drone = Self {
            id,
            lines: BufReader::new(reader).lines(),
            writer,
        };
        drone
            .send(json!({ "type": "hello", "payload": { "drone_id": id } }))
            .await;

        let fleet = harness.handler.fleet().clone();
        eventually(|| fleet.is_connected(id)).await;
        drone
    }

    async fn send(&mut self, frame: Value) {
        let line = format!("{frame}\n");
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn command(&mut self) -> DroneCommand {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("no command within 2s")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn heartbeat(&mut self) {
        self.send(json!({
            "type": "heartbeat",
            "payload": { "status": "in_transit", "battery_level": 76.0 }
        }))
        .await;
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

fn task_for(drone_id: DroneId) -> DeliveryTask {
    DeliveryTask {
        delivery_id: DeliveryId::new(),
        order_id: OrderId::new(),
        good_id: GoodId::new(),
        drone_id,
        parcel_automat_id: AutomatId::new(),
        aruco_id: 7,
        locker_cell_id: CellId::new(),
        internal_locker_cell_id: None,
        dimensions: Dimensions::new(120, 120, 120),
    }
}

#[tokio::test]
async fn arrival_opens_cell_then_drop_returns_drone_home() {
    let harness = start(false).await;
    let mut drone = SimulatedDrone::connect(&harness).await;
    let task = task_for(drone.id);
    harness.handler.fleet().assign(task.clone());

    drone
        .send(json!({
            "type": "arrived_at_destination",
            "payload": { "order_id": task.order_id, "parcel_automat_id": task.parcel_automat_id }
        }))
        .await;

    let cell_id = match drone.command().await {
        DroneCommand::DropCargo {
            order_id, cell_id, ..
        } => {
            assert_eq!(order_id, task.order_id);
            cell_id
        }
        other => panic!("expected drop_cargo, got {other:?}"),
    };

    drone
        .send(json!({
            "type": "cargo_dropped",
            "payload": { "order_id": task.order_id, "locker_cell_id": cell_id }
        }))
        .await;

    assert_eq!(
        drone.command().await,
        DroneCommand::ReturnToBase {
            delivery_id: Some(task.delivery_id),
            base_marker_id: BASE_MARKER,
        }
    );

    let events = harness.orchestrator.events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].event,
        DeliveryEvent::CargoDropped {
            locker_cell_id: Some(cell_id)
        }
    );
    assert!(harness.handler.fleet().active_task(drone.id).is_none());
}

#[tokio::test]
async fn refused_cell_open_fails_delivery_without_retrying() {
    let harness = start(true).await;
    let mut drone = SimulatedDrone::connect(&harness).await;
    let task = task_for(drone.id);
    harness.handler.fleet().assign(task.clone());

    drone
        .send(json!({
            "type": "arrived_at_destination",
            "payload": { "order_id": task.order_id, "parcel_automat_id": task.parcel_automat_id }
        }))
        .await;

    assert!(matches!(
        drone.command().await,
        DroneCommand::ReturnToBase {
            base_marker_id: BASE_MARKER,
            ..
        }
    ));

    let events = harness.orchestrator.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].event, DeliveryEvent::Failed { .. }));
    assert_eq!(harness.orchestrator.recorded.lock().unwrap().cell_opens, 1);
}

#[tokio::test]
async fn polled_task_starts_on_connected_drone() {
    let harness = start(false).await;
    let mut drone = SimulatedDrone::connect(&harness).await;
    let task = task_for(drone.id);
    harness.orchestrator.push_task(task.clone());

    let dispatcher = TaskDispatcher::new(harness.handler.clone(), 8, 3);
    dispatcher.tick().await;

    assert_eq!(
        drone.command().await,
        DroneCommand::StartDelivery(task.clone())
    );
    assert_eq!(
        harness.handler.fleet().active_task(drone.id),
        Some(task.clone())
    );

    // Repeated in-transit updates are reported once.
    for _ in 0..2 {
        drone
            .send(json!({
                "type": "delivery_update",
                "payload": {
                    "drone_status": "in_transit",
                    "delivery_id": task.delivery_id,
                    "order_id": task.order_id,
                }
            }))
            .await;
    }
    drone.heartbeat().await;

    let recorded = harness.orchestrator.recorded.clone();
    eventually(|| recorded.lock().unwrap().statuses.len() == 1).await;

    let events = harness.orchestrator.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, DeliveryEvent::InTransit);
    assert_eq!(events[0].drone_id, drone.id);
}

#[tokio::test]
async fn task_for_absent_drone_fails_after_bounded_attempts() {
    let harness = start(false).await;
    let task = task_for(DroneId::new());
    harness.orchestrator.push_task(task.clone());

    let dispatcher = TaskDispatcher::new(harness.handler.clone(), 8, 2);
    dispatcher.tick().await;
    assert!(harness.orchestrator.events().is_empty());
    assert_eq!(harness.handler.fleet().pending().len(), 1);

    dispatcher.tick().await;
    let events = harness.orchestrator.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].order_id, task.order_id);
    assert!(matches!(events[0].event, DeliveryEvent::Failed { .. }));
    assert!(harness.handler.fleet().pending().is_empty());
}

#[tokio::test]
async fn cancellation_reaches_the_flying_drone() {
    let harness = start(false).await;
    let mut drone = SimulatedDrone::connect(&harness).await;
    let task = task_for(drone.id);
    harness.orchestrator.push_task(task.clone());

    let dispatcher = TaskDispatcher::new(harness.handler.clone(), 8, 3);
    dispatcher.tick().await;
    assert!(matches!(
        drone.command().await,
        DroneCommand::StartDelivery(_)
    ));

    harness
        .orchestrator
        .cancelled
        .lock()
        .unwrap()
        .push(CancelledDelivery {
            delivery_id: task.delivery_id,
            order_id: task.order_id,
            drone_id: drone.id,
        });
    dispatcher.tick().await;

    assert_eq!(
        drone.command().await,
        DroneCommand::CancelDelivery {
            delivery_id: task.delivery_id
        }
    );
    assert!(harness.handler.fleet().active_task(drone.id).is_none());
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let harness = start(false).await;
    let stream = TcpStream::connect(harness.telemetry).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(b"{\"type\":\"heartbeat\",\"payload\":{\"status\":\"idle\",\"battery_level\":90.0}}\n")
        .await
        .unwrap();

    let mut lines = BufReader::new(reader).lines();
    let closed = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap();
    assert!(matches!(closed, Ok(None) | Err(_)));
    assert!(harness.handler.fleet().snapshot().is_empty());
}

#[tokio::test]
async fn unknown_frames_are_dropped_without_disconnecting() {
    let harness = start(false).await;
    let mut drone = SimulatedDrone::connect(&harness).await;

    drone
        .send(json!({ "type": "barrel_roll", "payload": {} }))
        .await;
    drone.send(json!({ "type": "video_frame", "payload": { "jpeg": "..." } })).await;
    drone.heartbeat().await;

    let recorded = harness.orchestrator.recorded.clone();
    eventually(|| recorded.lock().unwrap().statuses.len() == 1).await;

    let status = recorded.lock().unwrap().statuses[0];
    assert_eq!(status.drone_id, drone.id);
    assert_eq!(status.battery_level, 76.0);

    let view = harness.handler.fleet().get(drone.id).unwrap();
    assert!(view.connected);
    assert_eq!(view.video_frames, 1);
}

#[tokio::test]
async fn http_lists_drones_and_forwards_control() {
    let harness = start(false).await;
    let mut drone = SimulatedDrone::connect(&harness).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = skyport_drone::router(harness.handler.fleet().clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let http = reqwest::Client::new();

    let listed: Value = http
        .get(format!("{base}/drones"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["data"][0]["drone_id"], drone.id.to_string());
    assert_eq!(listed["data"][0]["connected"], true);

    let response = http
        .post(format!("{base}/drones/{}/control", drone.id))
        .json(&json!({ "action": "hold" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        drone.command().await,
        DroneCommand::Control {
            action: ControlAction::Hold
        }
    );

    let missing = http
        .post(format!("{base}/drones/{}/control", DroneId::new()))
        .json(&json!({ "action": "land" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}
