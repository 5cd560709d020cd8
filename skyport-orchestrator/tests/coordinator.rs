use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skyport_core::http::{CellAction, OpenCellResponse, SyncCellsRequest, SyncCellsResponse};
use skyport_core::{
    CellClass, CellId, CellOpenRequest, CellStatus, DeliveryEvent, DeliveryEventRequest,
    DeliveryStatus, Dimensions, DroneStatus, DroneStatusReport, Good, Order, OrderStatus,
    ParcelAutomat, User,
};
use skyport_orchestrator::config::AutomatDefaults;
use skyport_orchestrator::{
    AgentError, Coordinator, CoordinatorError, LockerAgent, MemoryStore, NewAutomat, NewDrone,
    NewGood, Store, TokenAuthority,
};
use tokio::sync::Mutex;

#[derive(Default)]
struct FakeAgent {
    synced: Mutex<Vec<SyncCellsRequest>>,
    prepared: Mutex<Vec<CellId>>,
    reject_prepare: bool,
}

#[async_trait]
impl LockerAgent for FakeAgent {
    async fn sync_cells(
        &self,
        _agent_url: &str,
        request: &SyncCellsRequest,
    ) -> Result<SyncCellsResponse, AgentError> {
        self.synced.lock().await.push(request.clone());
        Ok(SyncCellsResponse {
            success: true,
            parcel_automat_id: request.parcel_automat_id.parse().unwrap(),
            external_count: request.external_cell_ids.len(),
            internal_count: request.internal_cell_ids.len(),
        })
    }

    async fn prepare_cell(
        &self,
        _agent_url: &str,
        cell_id: CellId,
    ) -> Result<OpenCellResponse, AgentError> {
        if self.reject_prepare {
            return Err(AgentError::Rejected {
                status: 409,
                message: "cell mapping not initialized".to_string(),
                code: Some("not_initialized".to_string()),
            });
        }
        self.prepared.lock().await.push(cell_id);
        Ok(OpenCellResponse {
            success: true,
            cell_number: 1,
            cell_id,
            class: CellClass::External,
            action: CellAction::Opened,
            actuator_status: "ok".to_string(),
        })
    }
}

type TestCoordinator = Coordinator<MemoryStore, FakeAgent>;

fn coordinator_with(agent: FakeAgent) -> (TestCoordinator, Arc<FakeAgent>) {
    let agent = Arc::new(agent);
    let tokens = TokenAuthority::new(
        "test-secret",
        Duration::from_secs(3600),
        Duration::from_secs(600),
    )
    .unwrap();
    let coordinator = Coordinator::new(
        MemoryStore::new(),
        agent.clone(),
        Arc::new(tokens),
        AutomatDefaults::default(),
    );
    (coordinator, agent)
}

fn coordinator() -> (TestCoordinator, Arc<FakeAgent>) {
    coordinator_with(FakeAgent::default())
}

struct Fixture {
    user: User,
    good: Good,
    automat: ParcelAutomat,
}

/// One user, a 250mm cube good and an automat whose third cell is the
/// smallest one that fits it.
async fn fixture(c: &TestCoordinator, internal_doors: u32) -> Fixture {
    let user = c.register_user("ada@example.com", "Ada").await.unwrap();
    let good = c
        .register_good(NewGood {
            name: "kettle".into(),
            weight: 1200,
            dimensions: Dimensions::new(250, 250, 250),
            quantity: 5,
        })
        .await
        .unwrap();
    let small = Dimensions::new(100, 100, 100);
    let medium = Dimensions::new(300, 300, 300);
    let large = Dimensions::new(500, 500, 500);
    let (automat, _) = c
        .create_automat(NewAutomat {
            address: "1 Dock Street".into(),
            agent_url: "http://agent.invalid".into(),
            number_of_cells: 5,
            aruco_id: 42,
            internal_doors: Some(internal_doors),
            cell_dimensions: Some(vec![small, large, medium, medium, large]),
        })
        .await
        .unwrap();

    Fixture {
        user,
        good,
        automat,
    }
}

async fn cell(c: &TestCoordinator, id: CellId) -> skyport_core::LockerCell {
    c.store().get_cell(id).await.unwrap().unwrap()
}

async fn drone(c: &TestCoordinator) -> skyport_core::Drone {
    c.register_drone(NewDrone {
        model: "quad-x".into(),
        ip_address: "10.0.0.7".into(),
    })
    .await
    .unwrap()
}

async fn deliver(c: &TestCoordinator, order: &Order) {
    let delivery = c
        .store()
        .get_delivery_by_order(order.id)
        .await
        .unwrap()
        .unwrap();
    c.open_cell_for_drop(CellOpenRequest {
        order_id: order.id,
        parcel_automat_id: order.parcel_automat_id,
    })
    .await
    .unwrap();
    let status = c
        .delivery_event(DeliveryEventRequest {
            order_id: order.id,
            drone_id: delivery.drone_id.unwrap(),
            event: DeliveryEvent::CargoDropped {
                locker_cell_id: order.locker_cell_id,
            },
        })
        .await
        .unwrap();
    assert_eq!(status, OrderStatus::Delivered);
}

#[tokio::test]
async fn creating_an_automat_pushes_its_mapping() {
    let (c, agent) = coordinator();
    let f = fixture(&c, 2).await;

    let synced = agent.synced.lock().await;
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].parcel_automat_id, f.automat.id.to_string());
    assert_eq!(synced[0].external_cell_ids.len(), 5);
    assert_eq!(synced[0].internal_cell_ids.len(), 2);
}

#[tokio::test]
async fn order_reserves_smallest_fitting_cell_with_lowest_number() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;

    let first = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    let second = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();

    let first_cell = cell(&c, first.locker_cell_id.unwrap()).await;
    let second_cell = cell(&c, second.locker_cell_id.unwrap()).await;
    assert_eq!(first_cell.number, 3);
    assert_eq!(second_cell.number, 4);
    assert_eq!(first_cell.status, CellStatus::Reserved);
    assert_eq!(c.get_good(f.good.id).await.unwrap().quantity_available, 3);
}

#[tokio::test]
async fn internal_door_prefers_the_matching_number() {
    let (c, _) = coordinator();
    let f = fixture(&c, 4).await;

    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    let door = cell(&c, order.internal_cell_id.unwrap()).await;
    assert_eq!(door.class, CellClass::Internal);
    assert_eq!(door.number, 3);
    assert_eq!(door.status, CellStatus::Reserved);
}

#[tokio::test]
async fn automat_is_picked_when_the_order_names_none() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;

    let order = c.create_order(f.user.id, f.good.id, None).await.unwrap();
    assert_eq!(order.parcel_automat_id, f.automat.id);
}

#[tokio::test]
async fn running_out_of_cells_rolls_back_stock() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;

    // Cells 2..=5 fit; cell 1 is too small.
    for _ in 0..4 {
        c.create_order(f.user.id, f.good.id, Some(f.automat.id))
            .await
            .unwrap();
    }
    assert_eq!(c.get_good(f.good.id).await.unwrap().quantity_available, 1);

    let err = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoAvailableCell));
    assert_eq!(c.get_good(f.good.id).await.unwrap().quantity_available, 1);
}

#[tokio::test]
async fn out_of_stock_is_a_conflict() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;
    let rare = c
        .register_good(NewGood {
            name: "lamp".into(),
            weight: 300,
            dimensions: Dimensions::new(50, 50, 50),
            quantity: 0,
        })
        .await
        .unwrap();

    let err = c
        .create_order(f.user.id, rare.id, Some(f.automat.id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));
}

#[tokio::test]
async fn delivery_waits_for_a_drone_then_gets_assigned() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;

    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::CellReserved);
    let delivery = c
        .store()
        .get_delivery_by_order(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::AwaitingDrone);
    assert_eq!(c.assign_pending_deliveries().await.unwrap(), 0);

    let drone = drone(&c).await;
    assert_eq!(c.assign_pending_deliveries().await.unwrap(), 1);

    let order = c.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::DroneAssigned);
    let polled = c.poll_tasks(10).await;
    assert_eq!(polled.tasks.len(), 1);
    assert_eq!(polled.tasks[0].drone_id, drone.id);
    assert_eq!(polled.tasks[0].aruco_id, 42);
    assert_eq!(polled.tasks[0].dimensions, f.good.dimensions);
}

#[tokio::test]
async fn busy_drones_are_not_assigned() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;
    let drone = drone(&c).await;
    c.record_drone_status(DroneStatusReport {
        drone_id: drone.id,
        status: DroneStatus::Charging,
        battery_level: 12.0,
        timestamp: jiff::Timestamp::now(),
    })
    .await
    .unwrap();

    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::CellReserved);

    let stored = c.store().get_drone(drone.id).await.unwrap().unwrap();
    assert_eq!(stored.battery_level, 12.0);
    assert!(stored.last_seen.is_some());
}

#[tokio::test]
async fn drop_off_requires_the_cell_to_be_opened_first() {
    let (c, agent) = coordinator();
    let f = fixture(&c, 0).await;
    let drone = drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();

    let dropped = DeliveryEventRequest {
        order_id: order.id,
        drone_id: drone.id,
        event: DeliveryEvent::CargoDropped {
            locker_cell_id: order.locker_cell_id,
        },
    };
    let err = c.delivery_event(dropped.clone()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));

    let in_transit = c
        .delivery_event(DeliveryEventRequest {
            event: DeliveryEvent::InTransit,
            ..dropped.clone()
        })
        .await
        .unwrap();
    assert_eq!(in_transit, OrderStatus::InTransit);

    let opened = c
        .open_cell_for_drop(CellOpenRequest {
            order_id: order.id,
            parcel_automat_id: f.automat.id,
        })
        .await
        .unwrap();
    assert!(opened.success);
    assert_eq!(*agent.prepared.lock().await, vec![order.locker_cell_id.unwrap()]);

    assert_eq!(
        c.delivery_event(dropped).await.unwrap(),
        OrderStatus::Delivered
    );
    assert_eq!(
        cell(&c, order.locker_cell_id.unwrap()).await.status,
        CellStatus::Occupied
    );
    let delivery = c
        .store()
        .get_delivery_by_order(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert!(delivery.started_at.is_some());
    assert!(delivery.completed_at.is_some());
    let drone = c.store().get_drone(drone.id).await.unwrap().unwrap();
    assert_eq!(drone.current_delivery, None);
}

#[tokio::test]
async fn drop_off_opens_the_internal_door_when_reserved() {
    let (c, agent) = coordinator();
    let f = fixture(&c, 3).await;
    drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();

    let opened = c
        .open_cell_for_drop(CellOpenRequest {
            order_id: order.id,
            parcel_automat_id: f.automat.id,
        })
        .await
        .unwrap();

    assert_eq!(opened.internal_cell_id, order.internal_cell_id);
    assert_eq!(
        *agent.prepared.lock().await,
        vec![order.internal_cell_id.unwrap()]
    );
}

#[tokio::test]
async fn rejected_cell_open_is_reported_and_leaves_the_order_in_place() {
    let (c, _) = coordinator_with(FakeAgent {
        reject_prepare: true,
        ..FakeAgent::default()
    });
    let f = fixture(&c, 0).await;
    drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();

    let err = c
        .open_cell_for_drop(CellOpenRequest {
            order_id: order.id,
            parcel_automat_id: f.automat.id,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::CellOpenFailed(_)));
    assert_eq!(
        c.get_order(order.id).await.unwrap().status,
        OrderStatus::DroneAssigned
    );
}

#[tokio::test]
async fn failed_delivery_releases_cells_and_drone() {
    let (c, _) = coordinator();
    let f = fixture(&c, 2).await;
    let drone = drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();

    let status = c
        .delivery_event(DeliveryEventRequest {
            order_id: order.id,
            drone_id: drone.id,
            event: DeliveryEvent::Failed {
                reason: "landing marker not found".into(),
            },
        })
        .await
        .unwrap();
    assert_eq!(status, OrderStatus::Failed);

    assert_eq!(
        cell(&c, order.locker_cell_id.unwrap()).await.status,
        CellStatus::Available
    );
    assert_eq!(
        cell(&c, order.internal_cell_id.unwrap()).await.status,
        CellStatus::Available
    );
    let drone = c.store().get_drone(drone.id).await.unwrap().unwrap();
    assert_eq!(drone.current_delivery, None);
}

#[tokio::test]
async fn events_from_another_drone_are_rejected() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;
    drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();

    let err = c
        .delivery_event(DeliveryEventRequest {
            order_id: order.id,
            drone_id: skyport_core::DroneId::new(),
            event: DeliveryEvent::InTransit,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));
}

#[tokio::test]
async fn pickup_token_opens_the_order_cell_once() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;
    drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    deliver(&c, &order).await;

    let token = c.issue_pickup_token(order.id).await.unwrap();
    let cells = c.process_scan(&token.rendering, f.automat.id).await.unwrap();
    assert_eq!(cells, vec![order.locker_cell_id.unwrap()]);

    let confirmed = c.confirm_pickup(&cells).await.unwrap();
    assert_eq!(confirmed.confirmed, cells);
    assert!(confirmed.failed.is_empty());
    assert_eq!(
        c.get_order(order.id).await.unwrap().status,
        OrderStatus::PickedUp
    );
    assert_eq!(cell(&c, cells[0]).await.status, CellStatus::Available);

    let err = c
        .process_scan(&token.rendering, f.automat.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoOrdersForPickup));
}

#[tokio::test]
async fn pickup_token_for_another_automat_grants_nothing() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;
    drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    deliver(&c, &order).await;

    let token = c.issue_pickup_token(order.id).await.unwrap();
    let err = c
        .process_scan(&token.rendering, skyport_core::AutomatId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoOrdersForPickup));
}

#[tokio::test]
async fn identity_token_collects_delivered_orders_at_the_automat() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;
    drone(&c).await;
    drone(&c).await;

    let delivered = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    let pending = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    deliver(&c, &delivered).await;

    let token = c.issue_identity_token(f.user.id).await.unwrap();
    let cells = c.process_scan(&token.rendering, f.automat.id).await.unwrap();
    assert_eq!(cells, vec![delivered.locker_cell_id.unwrap()]);
    assert!(!cells.contains(&pending.locker_cell_id.unwrap()));
}

#[tokio::test]
async fn identity_token_without_deliveries_grants_nothing() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;

    let token = c.issue_identity_token(f.user.id).await.unwrap();
    let err = c
        .process_scan(&token.rendering, f.automat.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoOrdersForPickup));
}

#[tokio::test]
async fn tampered_token_is_rejected() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;

    let token = c.issue_identity_token(f.user.id).await.unwrap();
    let forged = token.rendering.replace("ada@example.com", "eve@example.com");
    let err = c.process_scan(&forged, f.automat.id).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Validation(_)));
}

#[tokio::test]
async fn current_identity_token_is_stable_until_reissued() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;

    let first = c.current_identity_token(f.user.id).await.unwrap();
    let again = c.current_identity_token(f.user.id).await.unwrap();
    assert_eq!(first.rendering, again.rendering);

    let user = c.get_user(f.user.id).await.unwrap();
    assert_eq!(user.token_expires_at, Some(first.expires_at));
}

#[tokio::test]
async fn duplicate_email_is_a_conflict() {
    let (c, _) = coordinator();
    c.register_user("bo@example.com", "Bo").await.unwrap();

    let err = c.register_user("bo@example.com", "Bo Two").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));
    let err = c.register_user("not-an-email", "Bo").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidInput(_)));
}

#[tokio::test]
async fn concurrent_pickup_confirmations_have_one_winner() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;
    drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    deliver(&c, &order).await;
    let cell_id = order.locker_cell_id.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let c = c.clone();
            tokio::spawn(async move { c.confirm_pickup_cell(cell_id).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(id) => {
                assert_eq!(id, order.id);
                winners += 1;
            }
            Err(e) => assert!(matches!(e, CoordinatorError::Conflict(_))),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn concurrent_orders_never_share_a_cell() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let c = c.clone();
            let (user, good, automat) = (f.user.id, f.good.id, f.automat.id);
            tokio::spawn(async move { c.create_order(user, good, Some(automat)).await })
        })
        .collect();

    let mut cells = Vec::new();
    for handle in handles {
        cells.push(handle.await.unwrap().unwrap().locker_cell_id.unwrap());
    }
    cells.sort();
    cells.dedup();
    assert_eq!(cells.len(), 4);
}

#[tokio::test]
async fn cancelling_releases_everything_and_notifies_the_drone() {
    let (c, _) = coordinator();
    let f = fixture(&c, 2).await;
    let drone = drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();
    assert_eq!(c.poll_tasks(10).await.tasks.len(), 1);

    let cancelled = c.cancel_order(order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(
        cell(&c, order.locker_cell_id.unwrap()).await.status,
        CellStatus::Available
    );
    assert_eq!(
        cell(&c, order.internal_cell_id.unwrap()).await.status,
        CellStatus::Available
    );
    assert_eq!(c.get_good(f.good.id).await.unwrap().quantity_available, 5);

    let polled = c.poll_tasks(10).await;
    assert_eq!(polled.cancelled.len(), 1);
    assert_eq!(polled.cancelled[0].drone_id, drone.id);

    let err = c.cancel_order(order.id).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Conflict(_)));
}

#[tokio::test]
async fn cancelling_before_dispatch_drops_the_queued_task() {
    let (c, _) = coordinator();
    let f = fixture(&c, 0).await;
    drone(&c).await;
    let order = c
        .create_order(f.user.id, f.good.id, Some(f.automat.id))
        .await
        .unwrap();

    c.cancel_order(order.id).await.unwrap();

    let polled = c.poll_tasks(10).await;
    assert!(polled.tasks.is_empty());
    assert!(polled.cancelled.is_empty());
}
