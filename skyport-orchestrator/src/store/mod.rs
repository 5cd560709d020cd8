pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use jiff::Timestamp;
use skyport_core::{
    AutomatId, CellId, CellStatus, Delivery, DeliveryId, DeliveryStatus, Drone, DroneId,
    DroneStatus, Good, GoodId, LockerCell, Order, OrderId, OrderStatus, ParcelAutomat, User,
    UserId,
};

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreError};

/// Persistence for every record the orchestrator owns.
///
/// Methods returning `bool` are compare-and-set updates: `true` means this
/// call applied the change, `false` that the record was missing or no longer
/// in the expected state.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// `false` when the email is already registered.
    async fn insert_user(&self, user: User) -> Result<bool, Self::Error>;
    async fn get_user(&self, id: UserId) -> Result<Option<User>, Self::Error>;
    async fn record_identity_token(
        &self,
        id: UserId,
        issued_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<bool, Self::Error>;

    async fn insert_good(&self, good: Good) -> Result<(), Self::Error>;
    async fn get_good(&self, id: GoodId) -> Result<Option<Good>, Self::Error>;
    /// Add `delta` to the available quantity, refusing to go below zero.
    async fn adjust_stock(&self, id: GoodId, delta: i64) -> Result<bool, Self::Error>;

    async fn insert_automat(
        &self,
        automat: ParcelAutomat,
        cells: Vec<LockerCell>,
    ) -> Result<(), Self::Error>;
    async fn get_automat(&self, id: AutomatId) -> Result<Option<ParcelAutomat>, Self::Error>;
    async fn list_automats(&self) -> Result<Vec<ParcelAutomat>, Self::Error>;
    /// Cells of one automat, external first, each class by number.
    async fn list_cells(&self, automat: AutomatId) -> Result<Vec<LockerCell>, Self::Error>;
    async fn get_cell(&self, id: CellId) -> Result<Option<LockerCell>, Self::Error>;
    async fn transition_cell(
        &self,
        id: CellId,
        from: CellStatus,
        to: CellStatus,
    ) -> Result<bool, Self::Error>;

    async fn insert_drone(&self, drone: Drone) -> Result<(), Self::Error>;
    async fn get_drone(&self, id: DroneId) -> Result<Option<Drone>, Self::Error>;
    async fn list_drones(&self) -> Result<Vec<Drone>, Self::Error>;
    async fn record_drone_status(
        &self,
        id: DroneId,
        status: DroneStatus,
        battery_level: f32,
        at: Timestamp,
    ) -> Result<bool, Self::Error>;
    /// Claim an idle, unclaimed drone for `delivery`.
    async fn claim_drone(&self, id: DroneId, delivery: DeliveryId) -> Result<bool, Self::Error>;
    /// Drop the claim, if it is still held by `delivery`.
    async fn release_drone(&self, id: DroneId, delivery: DeliveryId)
    -> Result<bool, Self::Error>;

    async fn insert_order(&self, order: Order) -> Result<(), Self::Error>;
    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, Self::Error>;
    async fn list_orders_by_user(&self, user: UserId) -> Result<Vec<Order>, Self::Error>;
    /// The order in `status` whose external cell is `cell`.
    async fn find_order_by_cell(
        &self,
        cell: CellId,
        status: OrderStatus,
    ) -> Result<Option<Order>, Self::Error>;
    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, Self::Error>;

    async fn insert_delivery(&self, delivery: Delivery) -> Result<(), Self::Error>;
    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, Self::Error>;
    async fn get_delivery_by_order(&self, order: OrderId)
    -> Result<Option<Delivery>, Self::Error>;
    async fn list_deliveries_by_status(
        &self,
        status: DeliveryStatus,
    ) -> Result<Vec<Delivery>, Self::Error>;
    /// Replace `current` with `next`, provided the stored record still equals `current`.
    async fn update_delivery(&self, current: &Delivery, next: Delivery)
    -> Result<bool, Self::Error>;
}
