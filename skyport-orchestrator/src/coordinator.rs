//! Order, delivery and pickup workflows on top of a [`Store`].
//!
//! Every state change goes through a compare-and-set on the store, so two
//! replicas (or two requests on one replica) racing on the same cell, order
//! or drone resolve to exactly one winner.

use std::sync::Arc;

use jiff::Timestamp;
use skyport_core::http::{ConfirmPickupResponse, OpenCellResponse, SyncCellsRequest, SyncCellsResponse};
use skyport_core::{
    AutomatId, CancelledDelivery, CellClass, CellId, CellOpenRequest, CellOpenResponse, CellStatus,
    Delivery, DeliveryEvent, DeliveryEventRequest, DeliveryId, DeliveryStatus, DeliveryTask,
    Dimensions, Drone, DroneId, DroneStatus, DroneStatusReport, Good, GoodId, LockerCell, Order,
    OrderId, OrderStatus, ParcelAutomat, PollTasksResponse, User, UserId,
};
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentError, LockerAgent};
use crate::config::AutomatDefaults;
use crate::store::Store;
use crate::tasks::TaskQueue;
use crate::token::{Claims, IssuedToken, TokenAuthority, TokenError};

/// Attempts at a read-modify-write of a delivery before giving up.
const CAS_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("token rejected: {0}")]
    Validation(#[from] TokenError),
    #[error("token does not match a registered user")]
    UserMismatch,
    #[error("{0}")]
    Conflict(String),
    #[error("no available cell fits the order")]
    NoAvailableCell,
    #[error("no orders ready for pickup")]
    NoOrdersForPickup,
    #[error("cell could not be opened: {0}")]
    CellOpenFailed(String),
    #[error("locker agent unavailable: {0}")]
    Upstream(String),
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

type Result<T> = std::result::Result<T, CoordinatorError>;

fn db<E: std::error::Error + Send + Sync + 'static>(err: E) -> CoordinatorError {
    CoordinatorError::Storage(Box::new(err))
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> CoordinatorError {
    CoordinatorError::NotFound(format!("{kind} {id}"))
}

impl From<AgentError> for CoordinatorError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Rejected { message, .. } => CoordinatorError::CellOpenFailed(message),
            other => CoordinatorError::Upstream(other.to_string()),
        }
    }
}

/// A new parcel automat.
#[derive(Debug, Clone)]
pub struct NewAutomat {
    pub address: String,
    pub agent_url: String,
    pub number_of_cells: u32,
    pub aruco_id: u32,
    /// Internal doors to create; the configured default when `None`.
    pub internal_doors: Option<u32>,
    /// Per-cell sizes in number order; the configured default when `None`.
    pub cell_dimensions: Option<Vec<Dimensions>>,
}

#[derive(Debug, Clone)]
pub struct NewGood {
    pub name: String,
    pub weight: u32,
    pub dimensions: Dimensions,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct NewDrone {
    pub model: String,
    pub ip_address: String,
}

pub struct Coordinator<S, A> {
    store: S,
    agent: Arc<A>,
    tokens: Arc<TokenAuthority>,
    tasks: TaskQueue,
    defaults: AutomatDefaults,
}

impl<S: Clone, A> Clone for Coordinator<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            agent: Arc::clone(&self.agent),
            tokens: Arc::clone(&self.tokens),
            tasks: self.tasks.clone(),
            defaults: self.defaults,
        }
    }
}

impl<S: Store, A: LockerAgent> Coordinator<S, A> {
    pub fn new(store: S, agent: Arc<A>, tokens: Arc<TokenAuthority>, defaults: AutomatDefaults) -> Self {
        Self {
            store,
            agent,
            tokens,
            tasks: TaskQueue::new(),
            defaults,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    // ---- users and identity tokens ----

    pub async fn register_user(&self, email: &str, name: &str) -> Result<User> {
        let email = email.trim();
        let name = name.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(CoordinatorError::InvalidInput(format!("invalid email: {email:?}")));
        }
        if name.is_empty() {
            return Err(CoordinatorError::InvalidInput("name must not be empty".into()));
        }

        let user = User {
            id: UserId::new(),
            email: email.into(),
            name: name.into(),
            token_issued_at: None,
            token_expires_at: None,
        };
        if !self.store.insert_user(user.clone()).await.map_err(db)? {
            return Err(CoordinatorError::Conflict(format!("email {email} already registered")));
        }

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    pub async fn get_user(&self, id: UserId) -> Result<User> {
        self.store
            .get_user(id)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found("user", id))
    }

    fn identity_claims(user: &User) -> Claims {
        Claims::Identity {
            user_id: user.id,
            email: user.email.to_string(),
            name: user.name.to_string(),
        }
    }

    /// Sign a fresh identity token and remember its validity window.
    pub async fn issue_identity_token(&self, user_id: UserId) -> Result<IssuedToken> {
        let user = self.get_user(user_id).await?;
        let issued = self.tokens.refresh(Self::identity_claims(&user))?;
        self.store
            .record_identity_token(user.id, issued.issued_at, issued.expires_at)
            .await
            .map_err(db)?;

        info!(user_id = %user.id, expires_at = %issued.expires_at, "identity token issued");
        Ok(issued)
    }

    /// The current identity token if it is still valid, otherwise a new one.
    pub async fn current_identity_token(&self, user_id: UserId) -> Result<IssuedToken> {
        let user = self.get_user(user_id).await?;
        if let (Some(issued_at), Some(expires_at)) = (user.token_issued_at, user.token_expires_at)
            && expires_at > Timestamp::now()
        {
            return Ok(self
                .tokens
                .sign(Self::identity_claims(&user), issued_at, expires_at)?);
        }

        self.issue_identity_token(user_id).await
    }

    // ---- inventory ----

    pub async fn register_good(&self, new: NewGood) -> Result<Good> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(CoordinatorError::InvalidInput("name must not be empty".into()));
        }
        if new.dimensions.volume() == 0 {
            return Err(CoordinatorError::InvalidInput(
                "dimensions must be positive".into(),
            ));
        }

        let good = Good {
            id: GoodId::new(),
            name: name.into(),
            weight: new.weight,
            dimensions: new.dimensions,
            quantity_available: new.quantity,
        };
        self.store.insert_good(good.clone()).await.map_err(db)?;
        Ok(good)
    }

    pub async fn get_good(&self, id: GoodId) -> Result<Good> {
        self.store
            .get_good(id)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found("good", id))
    }

    // ---- drones ----

    pub async fn register_drone(&self, new: NewDrone) -> Result<Drone> {
        if new.model.trim().is_empty() {
            return Err(CoordinatorError::InvalidInput("model must not be empty".into()));
        }

        let drone = Drone {
            id: DroneId::new(),
            model: new.model.trim().into(),
            ip_address: new.ip_address.trim().into(),
            status: DroneStatus::Idle,
            battery_level: 100.0,
            current_delivery: None,
            last_seen: None,
        };
        self.store.insert_drone(drone.clone()).await.map_err(db)?;

        info!(drone_id = %drone.id, model = %drone.model, "drone registered");
        Ok(drone)
    }

    pub async fn list_drones(&self) -> Result<Vec<Drone>> {
        self.store.list_drones().await.map_err(db)
    }

    pub async fn record_drone_status(&self, report: DroneStatusReport) -> Result<()> {
        let recorded = self
            .store
            .record_drone_status(
                report.drone_id,
                report.status,
                report.battery_level,
                report.timestamp,
            )
            .await
            .map_err(db)?;
        if !recorded {
            return Err(not_found("drone", report.drone_id));
        }

        debug!(drone_id = %report.drone_id, status = %report.status, "drone status recorded");
        Ok(())
    }

    // ---- parcel automats ----

    /// Create an automat with its external cells and internal doors, then
    /// push the mapping to its agent. An unreachable agent does not fail
    /// the creation; the mapping can be pushed later with [`Self::sync_automat`].
    pub async fn create_automat(&self, new: NewAutomat) -> Result<(ParcelAutomat, Vec<LockerCell>)> {
        if new.number_of_cells == 0 {
            return Err(CoordinatorError::InvalidInput(
                "number_of_cells must be at least 1".into(),
            ));
        }
        if new.agent_url.trim().is_empty() {
            return Err(CoordinatorError::InvalidInput("agent_url must not be empty".into()));
        }
        if let Some(dims) = &new.cell_dimensions
            && dims.len() != new.number_of_cells as usize
        {
            return Err(CoordinatorError::InvalidInput(format!(
                "expected {} cell dimensions, got {}",
                new.number_of_cells,
                dims.len()
            )));
        }

        let automat = ParcelAutomat {
            id: AutomatId::new(),
            address: new.address.trim().into(),
            agent_url: new.agent_url.trim().into(),
            number_of_cells: new.number_of_cells,
            aruco_id: new.aruco_id,
            is_working: true,
        };

        let cell = |number: u32, class: CellClass, dimensions: Dimensions| LockerCell {
            id: CellId::new(),
            parcel_automat_id: automat.id,
            number,
            class,
            dimensions,
            status: CellStatus::Available,
        };

        let mut cells: Vec<LockerCell> = (1..=new.number_of_cells)
            .map(|n| {
                let dims = new
                    .cell_dimensions
                    .as_ref()
                    .and_then(|d| d.get(n as usize - 1).copied())
                    .unwrap_or(self.defaults.cell_dimensions);
                cell(n, CellClass::External, dims)
            })
            .collect();
        let internal_doors = new.internal_doors.unwrap_or(self.defaults.internal_doors);
        cells.extend(
            (1..=internal_doors).map(|n| cell(n, CellClass::Internal, self.defaults.cell_dimensions)),
        );

        self.store
            .insert_automat(automat.clone(), cells.clone())
            .await
            .map_err(db)?;
        info!(
            automat_id = %automat.id,
            external = new.number_of_cells,
            internal = internal_doors,
            "parcel automat created"
        );

        if let Err(e) = self.push_mapping(&automat, &cells).await {
            warn!(automat_id = %automat.id, error = %e, "initial cell sync failed");
        }

        Ok((automat, cells))
    }

    pub async fn get_automat(&self, id: AutomatId) -> Result<(ParcelAutomat, Vec<LockerCell>)> {
        let automat = self
            .store
            .get_automat(id)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found("parcel automat", id))?;
        let cells = self.store.list_cells(id).await.map_err(db)?;
        Ok((automat, cells))
    }

    pub async fn list_automats(&self) -> Result<Vec<ParcelAutomat>> {
        self.store.list_automats().await.map_err(db)
    }

    /// Push the full cell mapping of an automat to its agent.
    pub async fn sync_automat(&self, id: AutomatId) -> Result<SyncCellsResponse> {
        let (automat, cells) = self.get_automat(id).await?;
        self.push_mapping(&automat, &cells)
            .await
            .map_err(|e| CoordinatorError::Upstream(e.to_string()))
    }

    async fn push_mapping(
        &self,
        automat: &ParcelAutomat,
        cells: &[LockerCell],
    ) -> std::result::Result<SyncCellsResponse, AgentError> {
        let ids = |class: CellClass| -> Vec<String> {
            cells
                .iter()
                .filter(|c| c.class == class)
                .map(|c| c.id.to_string())
                .collect()
        };
        let request = SyncCellsRequest {
            parcel_automat_id: automat.id.to_string(),
            external_cell_ids: ids(CellClass::External),
            internal_cell_ids: ids(CellClass::Internal),
        };

        let response = self.agent.sync_cells(&automat.agent_url, &request).await?;
        info!(
            automat_id = %automat.id,
            external = response.external_count,
            internal = response.internal_count,
            "cell mapping synced"
        );
        Ok(response)
    }

    /// Ask an automat's agent to open one of its cells.
    pub async fn prepare_cell(&self, automat_id: AutomatId, cell_id: CellId) -> Result<OpenCellResponse> {
        let (automat, _) = self.get_automat(automat_id).await?;
        let cell = self.get_cell(cell_id).await?;
        if cell.parcel_automat_id != automat.id {
            return Err(CoordinatorError::InvalidInput(format!(
                "cell {cell_id} does not belong to parcel automat {automat_id}"
            )));
        }

        Ok(self.agent.prepare_cell(&automat.agent_url, cell_id).await?)
    }

    async fn get_cell(&self, id: CellId) -> Result<LockerCell> {
        self.store
            .get_cell(id)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found("cell", id))
    }

    // ---- orders ----

    /// Reserve the smallest available external cell that fits `required`,
    /// lowest number first among equal sizes.
    pub async fn reserve_cell(
        &self,
        automat: AutomatId,
        required: &Dimensions,
    ) -> Result<Option<LockerCell>> {
        let mut candidates: Vec<LockerCell> = self
            .store
            .list_cells(automat)
            .await
            .map_err(db)?
            .into_iter()
            .filter(|c| {
                c.class == CellClass::External
                    && c.status == CellStatus::Available
                    && c.dimensions.fits(required)
            })
            .collect();
        candidates.sort_by_key(|c| (c.dimensions.volume(), c.number));

        for candidate in candidates {
            if self
                .store
                .transition_cell(candidate.id, CellStatus::Available, CellStatus::Reserved)
                .await
                .map_err(db)?
            {
                return Ok(Some(LockerCell {
                    status: CellStatus::Reserved,
                    ..candidate
                }));
            }
            debug!(cell_id = %candidate.id, "cell taken concurrently, trying next");
        }

        Ok(None)
    }

    /// Reserve an internal door, preferring the one numbered like the external cell.
    async fn reserve_internal_door(&self, automat: AutomatId, number: u32) -> Result<Option<CellId>> {
        let mut doors: Vec<LockerCell> = self
            .store
            .list_cells(automat)
            .await
            .map_err(db)?
            .into_iter()
            .filter(|c| c.class == CellClass::Internal && c.status == CellStatus::Available)
            .collect();
        doors.sort_by_key(|c| (c.number != number, c.number));

        for door in doors {
            if self
                .store
                .transition_cell(door.id, CellStatus::Available, CellStatus::Reserved)
                .await
                .map_err(db)?
            {
                return Ok(Some(door.id));
            }
        }

        Ok(None)
    }

    async fn pick_automat(&self, required: &Dimensions) -> Result<ParcelAutomat> {
        for automat in self.store.list_automats().await.map_err(db)? {
            if !automat.is_working {
                continue;
            }
            let cells = self.store.list_cells(automat.id).await.map_err(db)?;
            if cells.iter().any(|c| {
                c.class == CellClass::External
                    && c.status == CellStatus::Available
                    && c.dimensions.fits(required)
            }) {
                return Ok(automat);
            }
        }

        Err(CoordinatorError::NoAvailableCell)
    }

    /// Release whatever an order holds: cells back to available, stock back on the shelf.
    async fn release_reservation(
        &self,
        external: Option<CellId>,
        internal: Option<CellId>,
        good: Option<GoodId>,
    ) {
        for cell in [external, internal].into_iter().flatten() {
            match self
                .store
                .transition_cell(cell, CellStatus::Reserved, CellStatus::Available)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(cell_id = %cell, "cell was not reserved"),
                Err(e) => warn!(cell_id = %cell, error = %e, "failed to release cell"),
            }
        }
        if let Some(good) = good
            && let Err(e) = self.store.adjust_stock(good, 1).await
        {
            warn!(good_id = %good, error = %e, "failed to restore stock");
        }
    }

    /// Place an order: take one unit of stock, reserve a cell (and an
    /// internal door when one is free) and try to assign a drone right away.
    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        user_id: UserId,
        good_id: GoodId,
        automat_id: Option<AutomatId>,
    ) -> Result<Order> {
        self.get_user(user_id).await?;
        let good = self.get_good(good_id).await?;

        let automat = match automat_id {
            Some(id) => {
                let (automat, _) = self.get_automat(id).await?;
                if !automat.is_working {
                    return Err(CoordinatorError::Conflict(format!(
                        "parcel automat {id} is out of service"
                    )));
                }
                automat
            }
            None => self.pick_automat(&good.dimensions).await?,
        };

        if !self.store.adjust_stock(good.id, -1).await.map_err(db)? {
            return Err(CoordinatorError::Conflict(format!("{} is out of stock", good.name)));
        }

        let cell = match self.reserve_cell(automat.id, &good.dimensions).await {
            Ok(Some(cell)) => cell,
            Ok(None) => {
                self.release_reservation(None, None, Some(good.id)).await;
                return Err(CoordinatorError::NoAvailableCell);
            }
            Err(e) => {
                self.release_reservation(None, None, Some(good.id)).await;
                return Err(e);
            }
        };

        let internal = match self.reserve_internal_door(automat.id, cell.number).await {
            Ok(door) => door,
            Err(e) => {
                self.release_reservation(Some(cell.id), None, Some(good.id)).await;
                return Err(e);
            }
        };

        let now = Timestamp::now();
        let order = Order {
            id: OrderId::new(),
            user_id,
            good_id: good.id,
            parcel_automat_id: automat.id,
            locker_cell_id: Some(cell.id),
            internal_cell_id: internal,
            status: OrderStatus::CellReserved,
            created_at: now,
        };
        let delivery = Delivery {
            id: DeliveryId::new(),
            order_id: order.id,
            drone_id: None,
            parcel_automat_id: automat.id,
            locker_cell_id: cell.id,
            internal_locker_cell_id: internal,
            status: DeliveryStatus::AwaitingDrone,
            created_at: now,
            started_at: None,
            cell_opened_at: None,
            completed_at: None,
        };

        if let Err(e) = self.store.insert_order(order.clone()).await {
            self.release_reservation(Some(cell.id), internal, Some(good.id)).await;
            return Err(db(e));
        }
        if let Err(e) = self.store.insert_delivery(delivery.clone()).await {
            self.release_reservation(Some(cell.id), internal, Some(good.id)).await;
            let _ = self
                .store
                .transition_order(order.id, OrderStatus::CellReserved, OrderStatus::Failed)
                .await;
            return Err(db(e));
        }

        info!(
            order_id = %order.id,
            cell_number = cell.number,
            internal_door = internal.is_some(),
            "order created"
        );

        match self.try_assign(&order, delivery, &good, &automat).await {
            Ok(true) => {}
            Ok(false) => info!(order_id = %order.id, "no drone available, delivery awaiting drone"),
            Err(e) => warn!(order_id = %order.id, error = %e, "drone assignment failed"),
        }

        self.get_order(order.id).await
    }

    pub async fn get_order(&self, id: OrderId) -> Result<Order> {
        self.store
            .get_order(id)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found("order", id))
    }

    pub async fn list_orders(&self, user_id: UserId) -> Result<Vec<Order>> {
        self.get_user(user_id).await?;
        self.store.list_orders_by_user(user_id).await.map_err(db)
    }

    async fn delivery_for(&self, order: OrderId) -> Result<Delivery> {
        self.store
            .get_delivery_by_order(order)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found("delivery for order", order))
    }

    pub async fn get_delivery(&self, id: DeliveryId) -> Result<Delivery> {
        self.store
            .get_delivery(id)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found("delivery", id))
    }

    /// Read-modify-write of an order's delivery. `apply` returns `false` to
    /// leave the record untouched, in which case `None` is returned.
    async fn modify_delivery<F>(&self, order: OrderId, mut apply: F) -> Result<Option<Delivery>>
    where
        F: FnMut(&mut Delivery) -> bool + Send,
    {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.delivery_for(order).await?;
            let mut next = current.clone();
            if !apply(&mut next) {
                return Ok(None);
            }
            if self
                .store
                .update_delivery(&current, next.clone())
                .await
                .map_err(db)?
            {
                return Ok(Some(next));
            }
        }

        Err(CoordinatorError::Conflict(format!(
            "delivery for order {order} kept changing"
        )))
    }

    // ---- drone assignment ----

    /// Claim the best idle drone for a delivery and queue its task.
    async fn try_assign(
        &self,
        order: &Order,
        delivery: Delivery,
        good: &Good,
        automat: &ParcelAutomat,
    ) -> Result<bool> {
        let mut drones: Vec<Drone> = self
            .store
            .list_drones()
            .await
            .map_err(db)?
            .into_iter()
            .filter(|d| d.status == DroneStatus::Idle && d.current_delivery.is_none())
            .collect();
        drones.sort_by(|a, b| b.battery_level.total_cmp(&a.battery_level));

        for drone in drones {
            if !self.store.claim_drone(drone.id, delivery.id).await.map_err(db)? {
                continue;
            }

            if !self
                .store
                .transition_order(order.id, OrderStatus::CellReserved, OrderStatus::DroneAssigned)
                .await
                .map_err(db)?
            {
                self.store.release_drone(drone.id, delivery.id).await.map_err(db)?;
                return Ok(false);
            }

            let assigned = Delivery {
                drone_id: Some(drone.id),
                status: DeliveryStatus::Pending,
                ..delivery.clone()
            };
            if !self
                .store
                .update_delivery(&delivery, assigned)
                .await
                .map_err(db)?
            {
                self.store.release_drone(drone.id, delivery.id).await.map_err(db)?;
                return Ok(false);
            }

            self.tasks
                .push(DeliveryTask {
                    delivery_id: delivery.id,
                    order_id: order.id,
                    good_id: good.id,
                    drone_id: drone.id,
                    parcel_automat_id: automat.id,
                    aruco_id: automat.aruco_id,
                    locker_cell_id: delivery.locker_cell_id,
                    internal_locker_cell_id: delivery.internal_locker_cell_id,
                    dimensions: good.dimensions,
                })
                .await;

            info!(order_id = %order.id, drone_id = %drone.id, "drone assigned");
            return Ok(true);
        }

        Ok(false)
    }

    /// Retry assignment for every delivery still waiting for a drone.
    /// Returns how many were assigned.
    pub async fn assign_pending_deliveries(&self) -> Result<usize> {
        let waiting = self
            .store
            .list_deliveries_by_status(DeliveryStatus::AwaitingDrone)
            .await
            .map_err(db)?;

        let mut assigned = 0;
        for delivery in waiting {
            let order_id = delivery.order_id;
            let result: Result<bool> = async {
                let order = self.get_order(order_id).await?;
                if order.status != OrderStatus::CellReserved {
                    return Ok(false);
                }
                let good = self.get_good(order.good_id).await?;
                let (automat, _) = self.get_automat(order.parcel_automat_id).await?;
                self.try_assign(&order, delivery, &good, &automat).await
            }
            .await;

            match result {
                Ok(true) => assigned += 1,
                Ok(false) => {}
                Err(e) => warn!(order_id = %order_id, error = %e, "drone assignment failed"),
            }
        }

        Ok(assigned)
    }

    pub async fn poll_tasks(&self, max: u32) -> PollTasksResponse {
        let (tasks, cancelled) = self.tasks.take(max as usize).await;
        PollTasksResponse {
            tasks: tasks.into(),
            cancelled: cancelled.into(),
        }
    }

    // ---- delivery progress ----

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn delivery_event(&self, request: DeliveryEventRequest) -> Result<OrderStatus> {
        let order = self.get_order(request.order_id).await?;
        let delivery = self.delivery_for(order.id).await?;
        if delivery.drone_id != Some(request.drone_id) {
            return Err(CoordinatorError::Conflict(format!(
                "drone {} is not assigned to order {}",
                request.drone_id, order.id
            )));
        }

        match request.event {
            DeliveryEvent::InTransit => self.start_transit(order).await,
            DeliveryEvent::CargoDropped { locker_cell_id } => {
                if let Some(cell) = locker_cell_id
                    && order.locker_cell_id != Some(cell)
                    && order.internal_cell_id != Some(cell)
                {
                    return Err(CoordinatorError::InvalidInput(format!(
                        "cell {cell} is not assigned to order {}",
                        order.id
                    )));
                }
                self.complete_delivery(order).await
            }
            DeliveryEvent::Failed { reason } => self.fail_delivery(order, &reason).await,
        }
    }

    async fn start_transit(&self, order: Order) -> Result<OrderStatus> {
        if order.status == OrderStatus::InTransit {
            return Ok(order.status);
        }
        if !self
            .store
            .transition_order(order.id, OrderStatus::DroneAssigned, OrderStatus::InTransit)
            .await
            .map_err(db)?
        {
            return Err(CoordinatorError::Conflict(format!(
                "order {} is {}, not drone_assigned",
                order.id, order.status
            )));
        }

        let now = Timestamp::now();
        self.modify_delivery(order.id, |d| {
            if d.status != DeliveryStatus::Pending {
                return false;
            }
            d.status = DeliveryStatus::InTransit;
            d.started_at = Some(now);
            true
        })
        .await?;

        info!(order_id = %order.id, "delivery in transit");
        Ok(OrderStatus::InTransit)
    }

    /// Mark an order delivered. Requires that the agent confirmed opening
    /// the drop-off cell.
    async fn complete_delivery(&self, order: Order) -> Result<OrderStatus> {
        if order.status == OrderStatus::Delivered {
            return Ok(order.status);
        }
        if !matches!(
            order.status,
            OrderStatus::CellReserved | OrderStatus::DroneAssigned | OrderStatus::InTransit
        ) {
            return Err(CoordinatorError::Conflict(format!(
                "order {} is {}",
                order.id, order.status
            )));
        }

        let delivery = self.delivery_for(order.id).await?;
        if delivery.cell_opened_at.is_none() {
            return Err(CoordinatorError::Conflict(format!(
                "drop-off cell for order {} was never opened",
                order.id
            )));
        }

        if !self
            .store
            .transition_order(order.id, order.status, OrderStatus::Delivered)
            .await
            .map_err(db)?
        {
            return Err(CoordinatorError::Conflict(format!(
                "order {} changed concurrently",
                order.id
            )));
        }

        if let Some(cell) = order.locker_cell_id
            && !self
                .store
                .transition_cell(cell, CellStatus::Reserved, CellStatus::Occupied)
                .await
                .map_err(db)?
        {
            warn!(cell_id = %cell, "delivered into a cell that was not reserved");
        }

        let now = Timestamp::now();
        let updated = self
            .modify_delivery(order.id, |d| {
                d.status = DeliveryStatus::Delivered;
                d.completed_at = Some(now);
                true
            })
            .await?;
        if let Some(Delivery {
            id,
            drone_id: Some(drone),
            ..
        }) = updated
        {
            self.store.release_drone(drone, id).await.map_err(db)?;
        }

        info!(order_id = %order.id, "order delivered");

        match self.issue_pickup_token(order.id).await {
            Ok(token) => info!(
                order_id = %order.id,
                user_id = %order.user_id,
                expires_at = %token.expires_at,
                "pickup token issued"
            ),
            Err(e) => warn!(order_id = %order.id, error = %e, "failed to issue pickup token"),
        }

        Ok(OrderStatus::Delivered)
    }

    async fn fail_delivery(&self, order: Order, reason: &str) -> Result<OrderStatus> {
        if order.status == OrderStatus::Failed {
            return Ok(order.status);
        }
        if order.status.is_terminal() || order.status == OrderStatus::Delivered {
            return Err(CoordinatorError::Conflict(format!(
                "order {} is already {}",
                order.id, order.status
            )));
        }

        if !self
            .store
            .transition_order(order.id, order.status, OrderStatus::Failed)
            .await
            .map_err(db)?
        {
            return Err(CoordinatorError::Conflict(format!(
                "order {} changed concurrently",
                order.id
            )));
        }

        self.release_reservation(order.locker_cell_id, order.internal_cell_id, None)
            .await;

        let now = Timestamp::now();
        let updated = self
            .modify_delivery(order.id, |d| {
                d.status = DeliveryStatus::Failed;
                d.completed_at = Some(now);
                true
            })
            .await?;
        if let Some(Delivery {
            id,
            drone_id: Some(drone),
            ..
        }) = updated
        {
            self.store.release_drone(drone, id).await.map_err(db)?;
        }

        warn!(order_id = %order.id, reason, "delivery failed");
        Ok(OrderStatus::Failed)
    }

    /// Open the drop-off door for an arriving drone: the reserved internal
    /// door when there is one, otherwise the external cell.
    #[instrument(skip(self))]
    pub async fn open_cell_for_drop(&self, request: CellOpenRequest) -> Result<CellOpenResponse> {
        let order = self.get_order(request.order_id).await?;
        if order.parcel_automat_id != request.parcel_automat_id {
            return Err(CoordinatorError::InvalidInput(format!(
                "order {} is not bound for parcel automat {}",
                order.id, request.parcel_automat_id
            )));
        }
        if !matches!(
            order.status,
            OrderStatus::CellReserved | OrderStatus::DroneAssigned | OrderStatus::InTransit
        ) {
            return Err(CoordinatorError::Conflict(format!(
                "order {} is {}",
                order.id, order.status
            )));
        }

        let external = order
            .locker_cell_id
            .ok_or_else(|| CoordinatorError::Conflict(format!("order {} has no cell", order.id)))?;
        let cell = self.get_cell(external).await?;
        if cell.status != CellStatus::Reserved {
            return Err(CoordinatorError::Conflict(format!(
                "cell {} is {}, not reserved",
                cell.id, cell.status
            )));
        }

        let (automat, _) = self.get_automat(order.parcel_automat_id).await?;
        let target = order.internal_cell_id.unwrap_or(external);
        let opened = self.agent.prepare_cell(&automat.agent_url, target).await?;

        let now = Timestamp::now();
        self.modify_delivery(order.id, |d| {
            d.cell_opened_at = Some(now);
            true
        })
        .await?;

        info!(
            order_id = %order.id,
            cell_number = opened.cell_number,
            class = %opened.class,
            "drop-off cell opened"
        );
        Ok(CellOpenResponse {
            success: true,
            message: format!("cell {} opened", opened.cell_number).into(),
            cell_id: Some(external),
            internal_cell_id: order.internal_cell_id,
        })
    }

    /// The agent reports a parcel was loaded into `cell` through its internal door.
    pub async fn confirm_loaded(&self, order_id: OrderId, cell: CellId) -> Result<OrderStatus> {
        let order = self.get_order(order_id).await?;
        if order.locker_cell_id != Some(cell) && order.internal_cell_id != Some(cell) {
            return Err(CoordinatorError::InvalidInput(format!(
                "cell {cell} is not assigned to order {order_id}"
            )));
        }

        // The agent opened the door itself, so its confirmation stands in for
        // the orchestrator-initiated open.
        let now = Timestamp::now();
        self.modify_delivery(order.id, |d| {
            if d.cell_opened_at.is_some() {
                return false;
            }
            d.cell_opened_at = Some(now);
            true
        })
        .await?;

        self.complete_delivery(order).await
    }

    // ---- pickup ----

    pub async fn issue_pickup_token(&self, order_id: OrderId) -> Result<IssuedToken> {
        let order = self.get_order(order_id).await?;
        if order.status != OrderStatus::Delivered {
            return Err(CoordinatorError::Conflict(format!(
                "order {} is {}, not delivered",
                order.id, order.status
            )));
        }
        let cell = order
            .locker_cell_id
            .ok_or_else(|| CoordinatorError::Conflict(format!("order {} has no cell", order.id)))?;

        Ok(self.tokens.issue(Claims::Pickup {
            user_id: order.user_id,
            order_id: order.id,
            parcel_automat_id: order.parcel_automat_id,
            cell_ids: vec![cell],
        })?)
    }

    /// Resolve a scanned token to the cells its bearer may open at `automat`.
    #[instrument(skip(self, raw))]
    pub async fn process_scan(&self, raw: &str, automat: AutomatId) -> Result<Vec<CellId>> {
        let validated = self.tokens.validate(raw).inspect_err(|e| {
            warn!(reason = "validation", error = %e, "scan rejected");
        })?;

        let cells = match validated.claims {
            Claims::Pickup {
                user_id,
                order_id,
                parcel_automat_id,
                cell_ids,
            } => {
                if parcel_automat_id != automat {
                    return Err(CoordinatorError::NoOrdersForPickup);
                }
                let order = self.get_order(order_id).await?;
                if order.user_id != user_id {
                    return Err(CoordinatorError::UserMismatch);
                }
                if order.status != OrderStatus::Delivered {
                    return Err(CoordinatorError::NoOrdersForPickup);
                }

                let mut cells = Vec::new();
                for cell in cell_ids {
                    if order.locker_cell_id == Some(cell) && self.is_occupied(cell).await? {
                        cells.push(cell);
                    }
                }
                cells
            }
            Claims::Identity { user_id, email, .. } => {
                let user = self
                    .store
                    .get_user(user_id)
                    .await
                    .map_err(db)?
                    .ok_or(CoordinatorError::UserMismatch)?;
                if *user.email != *email {
                    return Err(CoordinatorError::UserMismatch);
                }

                let mut cells = Vec::new();
                for order in self.store.list_orders_by_user(user.id).await.map_err(db)? {
                    if order.status != OrderStatus::Delivered || order.parcel_automat_id != automat {
                        continue;
                    }
                    if let Some(cell) = order.locker_cell_id
                        && self.is_occupied(cell).await?
                    {
                        cells.push(cell);
                    }
                }
                cells
            }
        };

        if cells.is_empty() {
            return Err(CoordinatorError::NoOrdersForPickup);
        }

        info!(cells = cells.len(), "scan granted");
        Ok(cells)
    }

    async fn is_occupied(&self, cell: CellId) -> Result<bool> {
        Ok(self
            .store
            .get_cell(cell)
            .await
            .map_err(db)?
            .is_some_and(|c| c.status == CellStatus::Occupied))
    }

    /// Record that the parcel in `cell` was taken. Exactly one of several
    /// concurrent confirmations for the same cell succeeds.
    pub async fn confirm_pickup_cell(&self, cell: CellId) -> Result<OrderId> {
        self.get_cell(cell).await?;
        let order = self
            .store
            .find_order_by_cell(cell, OrderStatus::Delivered)
            .await
            .map_err(db)?
            .ok_or_else(|| {
                CoordinatorError::Conflict(format!("no delivered order waits in cell {cell}"))
            })?;

        if !self
            .store
            .transition_order(order.id, OrderStatus::Delivered, OrderStatus::PickedUp)
            .await
            .map_err(db)?
        {
            return Err(CoordinatorError::Conflict(format!(
                "order {} was already picked up",
                order.id
            )));
        }

        if !self
            .store
            .transition_cell(cell, CellStatus::Occupied, CellStatus::Available)
            .await
            .map_err(db)?
        {
            warn!(cell_id = %cell, "picked-up cell was not occupied");
        }
        self.release_reservation(None, order.internal_cell_id, None).await;

        info!(order_id = %order.id, cell_id = %cell, "parcel picked up");
        Ok(order.id)
    }

    pub async fn confirm_pickup(&self, cells: &[CellId]) -> Result<ConfirmPickupResponse> {
        if cells.is_empty() {
            return Err(CoordinatorError::InvalidInput("cell_ids must not be empty".into()));
        }

        let mut confirmed = Vec::new();
        let mut failed = Vec::new();
        for &cell in cells {
            match self.confirm_pickup_cell(cell).await {
                Ok(_) => confirmed.push(cell),
                Err(e @ CoordinatorError::Storage(_)) => return Err(e),
                Err(e) => {
                    warn!(cell_id = %cell, error = %e, "pickup not confirmed");
                    failed.push(cell);
                }
            }
        }

        Ok(ConfirmPickupResponse {
            success: failed.is_empty(),
            message: format!("confirmed {} of {} cell(s)", confirmed.len(), cells.len()),
            confirmed,
            failed,
        })
    }

    // ---- cancellation ----

    /// Cancel a non-terminal order, releasing its cells, stock and drone.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<Order> {
        let mut cancelled_from = None;
        for _ in 0..CAS_ATTEMPTS {
            let order = self.get_order(order_id).await?;
            if order.status.is_terminal() {
                return Err(CoordinatorError::Conflict(format!(
                    "order {order_id} is already {}",
                    order.status
                )));
            }
            if self
                .store
                .transition_order(order.id, order.status, OrderStatus::Cancelled)
                .await
                .map_err(db)?
            {
                cancelled_from = Some(order);
                break;
            }
        }
        let order = cancelled_from.ok_or_else(|| {
            CoordinatorError::Conflict(format!("order {order_id} kept changing"))
        })?;

        if let Some(cell) = order.locker_cell_id {
            let freed = self
                .store
                .transition_cell(cell, CellStatus::Reserved, CellStatus::Available)
                .await
                .map_err(db)?
                || self
                    .store
                    .transition_cell(cell, CellStatus::Occupied, CellStatus::Available)
                    .await
                    .map_err(db)?;
            if !freed {
                debug!(cell_id = %cell, "cell already released");
            }
        }
        self.release_reservation(None, order.internal_cell_id, Some(order.good_id))
            .await;

        let now = Timestamp::now();
        let mut in_flight = false;
        let updated = self
            .modify_delivery(order.id, |d| {
                if matches!(d.status, DeliveryStatus::Delivered | DeliveryStatus::Failed) {
                    return false;
                }
                in_flight = matches!(d.status, DeliveryStatus::Pending | DeliveryStatus::InTransit);
                d.status = DeliveryStatus::Cancelled;
                d.completed_at = Some(now);
                true
            })
            .await?;

        if let Some(Delivery {
            id,
            drone_id: Some(drone),
            ..
        }) = updated
        {
            self.store.release_drone(drone, id).await.map_err(db)?;
            if in_flight {
                self.tasks
                    .cancel(CancelledDelivery {
                        delivery_id: id,
                        order_id: order.id,
                        drone_id: drone,
                    })
                    .await;
            }
        }

        info!(order_id = %order.id, from = %order.status, "order cancelled");
        self.get_order(order.id).await
    }
}
