use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;
use skyport_core::{
    AutomatId, CellClass, CellId, CellStatus, Delivery, DeliveryId, DeliveryStatus, Drone,
    DroneId, DroneStatus, Good, GoodId, LockerCell, Order, OrderId, OrderStatus, ParcelAutomat,
    User, UserId,
};
use tokio::sync::RwLock;

use super::Store;

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    goods: HashMap<GoodId, Good>,
    automats: HashMap<AutomatId, ParcelAutomat>,
    cells: HashMap<CellId, LockerCell>,
    drones: HashMap<DroneId, Drone>,
    orders: HashMap<OrderId, Order>,
    deliveries: HashMap<DeliveryId, Delivery>,
}

/// Store kept entirely in process memory. Every compare-and-set runs under
/// one write lock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn class_rank(class: CellClass) -> u8 {
    match class {
        CellClass::External => 0,
        CellClass::Internal => 1,
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Error = Infallible;

    async fn insert_user(&self, user: User) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        if tables.users.values().any(|u| u.email == user.email) {
            return Ok(false);
        }
        tables.users.insert(user.id, user);
        Ok(true)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, Self::Error> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn record_identity_token(
        &self,
        id: UserId,
        issued_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables.users.get_mut(&id) else {
            return Ok(false);
        };
        user.token_issued_at = Some(issued_at);
        user.token_expires_at = Some(expires_at);
        Ok(true)
    }

    async fn insert_good(&self, good: Good) -> Result<(), Self::Error> {
        self.tables.write().await.goods.insert(good.id, good);
        Ok(())
    }

    async fn get_good(&self, id: GoodId) -> Result<Option<Good>, Self::Error> {
        Ok(self.tables.read().await.goods.get(&id).cloned())
    }

    async fn adjust_stock(&self, id: GoodId, delta: i64) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        let Some(good) = tables.goods.get_mut(&id) else {
            return Ok(false);
        };

        let next = good.quantity_available as i64 + delta;
        match u32::try_from(next) {
            Ok(quantity) => {
                good.quantity_available = quantity;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn insert_automat(
        &self,
        automat: ParcelAutomat,
        cells: Vec<LockerCell>,
    ) -> Result<(), Self::Error> {
        let mut tables = self.tables.write().await;
        for cell in cells {
            tables.cells.insert(cell.id, cell);
        }
        tables.automats.insert(automat.id, automat);
        Ok(())
    }

    async fn get_automat(&self, id: AutomatId) -> Result<Option<ParcelAutomat>, Self::Error> {
        Ok(self.tables.read().await.automats.get(&id).cloned())
    }

    async fn list_automats(&self) -> Result<Vec<ParcelAutomat>, Self::Error> {
        let tables = self.tables.read().await;
        let mut automats: Vec<ParcelAutomat> = tables.automats.values().cloned().collect();
        automats.sort_by_key(|a| a.id);
        Ok(automats)
    }

    async fn list_cells(&self, automat: AutomatId) -> Result<Vec<LockerCell>, Self::Error> {
        let tables = self.tables.read().await;
        let mut cells: Vec<LockerCell> = tables
            .cells
            .values()
            .filter(|c| c.parcel_automat_id == automat)
            .cloned()
            .collect();
        cells.sort_by_key(|c| (class_rank(c.class), c.number));
        Ok(cells)
    }

    async fn get_cell(&self, id: CellId) -> Result<Option<LockerCell>, Self::Error> {
        Ok(self.tables.read().await.cells.get(&id).cloned())
    }

    async fn transition_cell(
        &self,
        id: CellId,
        from: CellStatus,
        to: CellStatus,
    ) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        match tables.cells.get_mut(&id) {
            Some(cell) if cell.status == from => {
                cell.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_drone(&self, drone: Drone) -> Result<(), Self::Error> {
        self.tables.write().await.drones.insert(drone.id, drone);
        Ok(())
    }

    async fn get_drone(&self, id: DroneId) -> Result<Option<Drone>, Self::Error> {
        Ok(self.tables.read().await.drones.get(&id).cloned())
    }

    async fn list_drones(&self) -> Result<Vec<Drone>, Self::Error> {
        let tables = self.tables.read().await;
        let mut drones: Vec<Drone> = tables.drones.values().cloned().collect();
        drones.sort_by_key(|d| d.id);
        Ok(drones)
    }

    async fn record_drone_status(
        &self,
        id: DroneId,
        status: DroneStatus,
        battery_level: f32,
        at: Timestamp,
    ) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        let Some(drone) = tables.drones.get_mut(&id) else {
            return Ok(false);
        };
        drone.status = status;
        drone.battery_level = battery_level;
        drone.last_seen = Some(at);
        Ok(true)
    }

    async fn claim_drone(&self, id: DroneId, delivery: DeliveryId) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        match tables.drones.get_mut(&id) {
            Some(drone) if drone.status == DroneStatus::Idle && drone.current_delivery.is_none() => {
                drone.current_delivery = Some(delivery);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_drone(&self, id: DroneId, delivery: DeliveryId) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        match tables.drones.get_mut(&id) {
            Some(drone) if drone.current_delivery == Some(delivery) => {
                drone.current_delivery = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_order(&self, order: Order) -> Result<(), Self::Error> {
        self.tables.write().await.orders.insert(order.id, order);
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, Self::Error> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn list_orders_by_user(&self, user: UserId) -> Result<Vec<Order>, Self::Error> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.user_id == user)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn find_order_by_cell(
        &self,
        cell: CellId,
        status: OrderStatus,
    ) -> Result<Option<Order>, Self::Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .find(|o| o.locker_cell_id == Some(cell) && o.status == status)
            .cloned())
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(&id) {
            Some(order) if order.status == from => {
                order.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_delivery(&self, delivery: Delivery) -> Result<(), Self::Error> {
        self.tables
            .write()
            .await
            .deliveries
            .insert(delivery.id, delivery);
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, Self::Error> {
        Ok(self.tables.read().await.deliveries.get(&id).cloned())
    }

    async fn get_delivery_by_order(
        &self,
        order: OrderId,
    ) -> Result<Option<Delivery>, Self::Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .deliveries
            .values()
            .find(|d| d.order_id == order)
            .cloned())
    }

    async fn list_deliveries_by_status(
        &self,
        status: DeliveryStatus,
    ) -> Result<Vec<Delivery>, Self::Error> {
        let tables = self.tables.read().await;
        let mut deliveries: Vec<Delivery> = tables
            .deliveries
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        deliveries.sort_by_key(|d| d.created_at);
        Ok(deliveries)
    }

    async fn update_delivery(
        &self,
        current: &Delivery,
        next: Delivery,
    ) -> Result<bool, Self::Error> {
        let mut tables = self.tables.write().await;
        match tables.deliveries.get_mut(&current.id) {
            Some(stored) if stored == current => {
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
