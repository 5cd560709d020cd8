use jiff::Timestamp;
use skyport_core::{
    AutomatId, CellClass, CellId, CellStatus, Delivery, DeliveryId, DeliveryStatus, Dimensions,
    Drone, DroneId, DroneStatus, Good, GoodId, LockerCell, Order, OrderId, OrderStatus,
    ParcelAutomat, User, UserId,
};
use skyport_orchestrator::{SqliteStore, Store};
use tempfile::TempDir;

fn user(email: &str) -> User {
    User {
        id: UserId::new(),
        email: email.into(),
        name: "Test User".into(),
        token_issued_at: None,
        token_expires_at: None,
    }
}

fn automat_with_cells() -> (ParcelAutomat, Vec<LockerCell>) {
    let automat = ParcelAutomat {
        id: AutomatId::new(),
        address: "7 Quay Lane".into(),
        agent_url: "http://10.0.0.5:8000".into(),
        number_of_cells: 2,
        aruco_id: 3,
        is_working: true,
    };
    let cell = |number, class| LockerCell {
        id: CellId::new(),
        parcel_automat_id: automat.id,
        number,
        class,
        dimensions: Dimensions::new(300, 300, 300),
        status: CellStatus::Available,
    };
    let cells = vec![
        cell(1, CellClass::Internal),
        cell(2, CellClass::External),
        cell(1, CellClass::External),
    ];
    (automat, cells)
}

async fn open(dir: &TempDir) -> SqliteStore {
    SqliteStore::new(dir.path().join("orchestrator.db"))
        .await
        .unwrap()
}

#[tokio::test]
async fn records_survive_reopening_the_database() {
    let dir = TempDir::new().unwrap();
    let (automat, cells) = automat_with_cells();
    let issued = Timestamp::from_second(1_700_000_000).unwrap();
    let expires = Timestamp::from_second(1_700_604_800).unwrap();
    let u = user("kai@example.com");

    {
        let store = open(&dir).await;
        assert!(store.insert_user(u.clone()).await.unwrap());
        assert!(
            store
                .record_identity_token(u.id, issued, expires)
                .await
                .unwrap()
        );
        store
            .insert_automat(automat.clone(), cells.clone())
            .await
            .unwrap();
    }

    let store = open(&dir).await;
    let loaded = store.get_user(u.id).await.unwrap().unwrap();
    assert_eq!(loaded.token_issued_at, Some(issued));
    assert_eq!(loaded.token_expires_at, Some(expires));
    assert_eq!(store.get_automat(automat.id).await.unwrap(), Some(automat.clone()));

    let listed = store.list_cells(automat.id).await.unwrap();
    let order: Vec<(CellClass, u32)> = listed.iter().map(|c| (c.class, c.number)).collect();
    assert_eq!(
        order,
        vec![
            (CellClass::External, 1),
            (CellClass::External, 2),
            (CellClass::Internal, 1),
        ]
    );
}

#[tokio::test]
async fn duplicate_email_is_refused() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    assert!(store.insert_user(user("mo@example.com")).await.unwrap());
    assert!(!store.insert_user(user("mo@example.com")).await.unwrap());
}

#[tokio::test]
async fn stock_never_goes_negative() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let good = Good {
        id: GoodId::new(),
        name: "torch".into(),
        weight: 150,
        dimensions: Dimensions::new(50, 200, 50),
        quantity_available: 1,
    };
    store.insert_good(good.clone()).await.unwrap();

    assert!(store.adjust_stock(good.id, -1).await.unwrap());
    assert!(!store.adjust_stock(good.id, -1).await.unwrap());
    assert_eq!(
        store.get_good(good.id).await.unwrap().unwrap().quantity_available,
        0
    );
}

#[tokio::test]
async fn cell_and_order_transitions_are_compare_and_set() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let (automat, cells) = automat_with_cells();
    store.insert_automat(automat.clone(), cells.clone()).await.unwrap();
    let cell = cells[2].id;

    assert!(
        store
            .transition_cell(cell, CellStatus::Available, CellStatus::Reserved)
            .await
            .unwrap()
    );
    assert!(
        !store
            .transition_cell(cell, CellStatus::Available, CellStatus::Reserved)
            .await
            .unwrap()
    );

    let u = user("ria@example.com");
    store.insert_user(u.clone()).await.unwrap();
    let good = Good {
        id: GoodId::new(),
        name: "book".into(),
        weight: 500,
        dimensions: Dimensions::new(30, 200, 150),
        quantity_available: 1,
    };
    store.insert_good(good.clone()).await.unwrap();
    let order = Order {
        id: OrderId::new(),
        user_id: u.id,
        good_id: good.id,
        parcel_automat_id: automat.id,
        locker_cell_id: Some(cell),
        internal_cell_id: None,
        status: OrderStatus::Delivered,
        created_at: Timestamp::now(),
    };
    store.insert_order(order.clone()).await.unwrap();

    let found = store
        .find_order_by_cell(cell, OrderStatus::Delivered)
        .await
        .unwrap();
    assert_eq!(found.map(|o| o.id), Some(order.id));

    assert!(
        store
            .transition_order(order.id, OrderStatus::Delivered, OrderStatus::PickedUp)
            .await
            .unwrap()
    );
    assert!(
        !store
            .transition_order(order.id, OrderStatus::Delivered, OrderStatus::PickedUp)
            .await
            .unwrap()
    );
    assert!(
        store
            .find_order_by_cell(cell, OrderStatus::Delivered)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn drone_claims_are_exclusive() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let drone = Drone {
        id: DroneId::new(),
        model: "quad-x".into(),
        ip_address: "10.0.0.9".into(),
        status: DroneStatus::Idle,
        battery_level: 80.0,
        current_delivery: None,
        last_seen: None,
    };
    store.insert_drone(drone.clone()).await.unwrap();
    let (first, second) = (DeliveryId::new(), DeliveryId::new());

    assert!(store.claim_drone(drone.id, first).await.unwrap());
    assert!(!store.claim_drone(drone.id, second).await.unwrap());
    assert!(!store.release_drone(drone.id, second).await.unwrap());
    assert!(store.release_drone(drone.id, first).await.unwrap());
    assert!(store.claim_drone(drone.id, second).await.unwrap());
}

#[tokio::test]
async fn stale_delivery_snapshot_does_not_overwrite() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let (automat, cells) = automat_with_cells();
    store.insert_automat(automat.clone(), cells.clone()).await.unwrap();
    let u = user("sol@example.com");
    store.insert_user(u.clone()).await.unwrap();
    let good = Good {
        id: GoodId::new(),
        name: "mug".into(),
        weight: 350,
        dimensions: Dimensions::new(100, 100, 100),
        quantity_available: 1,
    };
    store.insert_good(good.clone()).await.unwrap();
    let order = Order {
        id: OrderId::new(),
        user_id: u.id,
        good_id: good.id,
        parcel_automat_id: automat.id,
        locker_cell_id: Some(cells[2].id),
        internal_cell_id: None,
        status: OrderStatus::DroneAssigned,
        created_at: Timestamp::now(),
    };
    store.insert_order(order.clone()).await.unwrap();

    let delivery = Delivery {
        id: DeliveryId::new(),
        order_id: order.id,
        drone_id: Some(DroneId::new()),
        parcel_automat_id: automat.id,
        locker_cell_id: cells[2].id,
        internal_locker_cell_id: None,
        status: DeliveryStatus::Pending,
        created_at: Timestamp::from_second(1_700_000_000).unwrap(),
        started_at: None,
        cell_opened_at: None,
        completed_at: None,
    };
    store.insert_delivery(delivery.clone()).await.unwrap();

    let opened = Delivery {
        cell_opened_at: Some(Timestamp::from_second(1_700_000_100).unwrap()),
        ..delivery.clone()
    };
    assert!(store.update_delivery(&delivery, opened.clone()).await.unwrap());

    // Same status, but the snapshot predates the cell opening.
    let in_transit = Delivery {
        status: DeliveryStatus::InTransit,
        ..delivery.clone()
    };
    assert!(!store.update_delivery(&delivery, in_transit).await.unwrap());

    let stored = store.get_delivery_by_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored, opened);
    assert_eq!(
        store
            .list_deliveries_by_status(DeliveryStatus::Pending)
            .await
            .unwrap()
            .len(),
        1
    );
}
