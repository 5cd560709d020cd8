use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use skyport_core::{
    AutomatId, CellId, CellStatus, Delivery, DeliveryId, DeliveryStatus, Dimensions, Drone,
    DroneId, DroneStatus, Good, GoodId, LockerCell, Order, OrderId, OrderStatus, ParcelAutomat,
    ParseStatusError, User, UserId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};

use super::Store;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid {kind} id: {value}")]
    InvalidId { kind: &'static str, value: String },
    #[error(transparent)]
    InvalidStatus(#[from] ParseStatusError),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("column {0} out of range")]
    OutOfRange(&'static str),
}

type Result<T> = std::result::Result<T, SqliteStoreError>;

/// Store backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

fn id<T: FromStr>(kind: &'static str, value: String) -> Result<T> {
    value
        .parse()
        .map_err(|_| SqliteStoreError::InvalidId { kind, value })
}

fn opt_id<T: FromStr>(kind: &'static str, value: Option<String>) -> Result<Option<T>> {
    value.map(|v| id(kind, v)).transpose()
}

fn ts(ms: i64) -> Result<Timestamp> {
    Timestamp::from_millisecond(ms).map_err(|_| SqliteStoreError::InvalidTimestamp(ms))
}

fn opt_ts(ms: Option<i64>) -> Result<Option<Timestamp>> {
    ms.map(ts).transpose()
}

fn u32_col(row: &SqliteRow, column: &'static str) -> Result<u32> {
    let value = row.try_get::<i64, _>(column)?;
    u32::try_from(value).map_err(|_| SqliteStoreError::OutOfRange(column))
}

fn dimensions(row: &SqliteRow) -> Result<Dimensions> {
    Ok(Dimensions::new(
        u32_col(row, "height")?,
        u32_col(row, "length")?,
        u32_col(row, "width")?,
    ))
}

fn user_from_row(row: SqliteRow) -> Result<User> {
    Ok(User {
        id: id("user", row.try_get("id")?)?,
        email: row.try_get::<String, _>("email")?.into(),
        name: row.try_get::<String, _>("name")?.into(),
        token_issued_at: opt_ts(row.try_get("token_issued_at")?)?,
        token_expires_at: opt_ts(row.try_get("token_expires_at")?)?,
    })
}

fn good_from_row(row: SqliteRow) -> Result<Good> {
    Ok(Good {
        id: id("good", row.try_get("id")?)?,
        name: row.try_get::<String, _>("name")?.into(),
        weight: u32_col(&row, "weight")?,
        dimensions: dimensions(&row)?,
        quantity_available: u32_col(&row, "quantity_available")?,
    })
}

fn automat_from_row(row: SqliteRow) -> Result<ParcelAutomat> {
    Ok(ParcelAutomat {
        id: id("automat", row.try_get("id")?)?,
        address: row.try_get::<String, _>("address")?.into(),
        agent_url: row.try_get::<String, _>("agent_url")?.into(),
        number_of_cells: u32_col(&row, "number_of_cells")?,
        aruco_id: u32_col(&row, "aruco_id")?,
        is_working: row.try_get("is_working")?,
    })
}

fn cell_from_row(row: SqliteRow) -> Result<LockerCell> {
    Ok(LockerCell {
        id: id("cell", row.try_get("id")?)?,
        parcel_automat_id: id("automat", row.try_get("parcel_automat_id")?)?,
        number: u32_col(&row, "number")?,
        class: row.try_get::<String, _>("class")?.parse()?,
        dimensions: dimensions(&row)?,
        status: row.try_get::<String, _>("status")?.parse()?,
    })
}

fn drone_from_row(row: SqliteRow) -> Result<Drone> {
    Ok(Drone {
        id: id("drone", row.try_get("id")?)?,
        model: row.try_get::<String, _>("model")?.into(),
        ip_address: row.try_get::<String, _>("ip_address")?.into(),
        status: row.try_get::<String, _>("status")?.parse()?,
        battery_level: row.try_get::<f64, _>("battery_level")? as f32,
        current_delivery: opt_id("delivery", row.try_get("current_delivery")?)?,
        last_seen: opt_ts(row.try_get("last_seen")?)?,
    })
}

fn order_from_row(row: SqliteRow) -> Result<Order> {
    Ok(Order {
        id: id("order", row.try_get("id")?)?,
        user_id: id("user", row.try_get("user_id")?)?,
        good_id: id("good", row.try_get("good_id")?)?,
        parcel_automat_id: id("automat", row.try_get("parcel_automat_id")?)?,
        locker_cell_id: opt_id("cell", row.try_get("locker_cell_id")?)?,
        internal_cell_id: opt_id("cell", row.try_get("internal_cell_id")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: ts(row.try_get("created_at")?)?,
    })
}

fn delivery_from_row(row: SqliteRow) -> Result<Delivery> {
    Ok(Delivery {
        id: id("delivery", row.try_get("id")?)?,
        order_id: id("order", row.try_get("order_id")?)?,
        drone_id: opt_id("drone", row.try_get("drone_id")?)?,
        parcel_automat_id: id("automat", row.try_get("parcel_automat_id")?)?,
        locker_cell_id: id("cell", row.try_get("locker_cell_id")?)?,
        internal_locker_cell_id: opt_id("cell", row.try_get("internal_locker_cell_id")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: ts(row.try_get("created_at")?)?,
        started_at: opt_ts(row.try_get("started_at")?)?,
        cell_opened_at: opt_ts(row.try_get("cell_opened_at")?)?,
        completed_at: opt_ts(row.try_get("completed_at")?)?,
    })
}

fn ms(t: Option<Timestamp>) -> Option<i64> {
    t.map(|t| t.as_millisecond())
}

fn text<T: ToString>(value: Option<T>) -> Option<String> {
    value.map(|v| v.to_string())
}

const ORDER_COLUMNS: &str = "id, user_id, good_id, parcel_automat_id, locker_cell_id, \
                             internal_cell_id, status, created_at";
const DELIVERY_COLUMNS: &str = "id, order_id, drone_id, parcel_automat_id, locker_cell_id, \
                                internal_locker_cell_id, status, created_at, started_at, \
                                cell_opened_at, completed_at";

#[async_trait]
impl Store for SqliteStore {
    type Error = SqliteStoreError;

    async fn insert_user(&self, user: User) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, email, name, token_issued_at, token_expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(user.id.to_string())
        .bind(&*user.email)
        .bind(&*user.name)
        .bind(ms(user.token_issued_at))
        .bind(ms(user.token_expires_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        sqlx::query(
            "SELECT id, email, name, token_issued_at, token_expires_at FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(user_from_row)
        .transpose()
    }

    async fn record_identity_token(
        &self,
        id: UserId,
        issued_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET token_issued_at = ?, token_expires_at = ? WHERE id = ?",
        )
        .bind(issued_at.as_millisecond())
        .bind(expires_at.as_millisecond())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_good(&self, good: Good) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO goods (id, name, weight, height, length, width, quantity_available)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(good.id.to_string())
        .bind(&*good.name)
        .bind(good.weight as i64)
        .bind(good.dimensions.height as i64)
        .bind(good.dimensions.length as i64)
        .bind(good.dimensions.width as i64)
        .bind(good.quantity_available as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_good(&self, id: GoodId) -> Result<Option<Good>> {
        sqlx::query(
            "SELECT id, name, weight, height, length, width, quantity_available FROM goods WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(good_from_row)
        .transpose()
    }

    async fn adjust_stock(&self, id: GoodId, delta: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE goods SET quantity_available = quantity_available + ?1
            WHERE id = ?2 AND quantity_available + ?1 >= 0
            "#,
        )
        .bind(delta)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_automat(&self, automat: ParcelAutomat, cells: Vec<LockerCell>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO parcel_automats
                (id, address, agent_url, number_of_cells, aruco_id, is_working)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(automat.id.to_string())
        .bind(&*automat.address)
        .bind(&*automat.agent_url)
        .bind(automat.number_of_cells as i64)
        .bind(automat.aruco_id as i64)
        .bind(automat.is_working)
        .execute(&mut *tx)
        .await?;

        for cell in cells {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO locker_cells
                    (id, parcel_automat_id, number, class, height, length, width, status)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(cell.id.to_string())
            .bind(cell.parcel_automat_id.to_string())
            .bind(cell.number as i64)
            .bind(cell.class.as_str())
            .bind(cell.dimensions.height as i64)
            .bind(cell.dimensions.length as i64)
            .bind(cell.dimensions.width as i64)
            .bind(cell.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_automat(&self, id: AutomatId) -> Result<Option<ParcelAutomat>> {
        sqlx::query(
            r#"
            SELECT id, address, agent_url, number_of_cells, aruco_id, is_working
            FROM parcel_automats WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(automat_from_row)
        .transpose()
    }

    async fn list_automats(&self) -> Result<Vec<ParcelAutomat>> {
        sqlx::query(
            r#"
            SELECT id, address, agent_url, number_of_cells, aruco_id, is_working
            FROM parcel_automats ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(automat_from_row)
        .collect()
    }

    async fn list_cells(&self, automat: AutomatId) -> Result<Vec<LockerCell>> {
        sqlx::query(
            r#"
            SELECT id, parcel_automat_id, number, class, height, length, width, status
            FROM locker_cells WHERE parcel_automat_id = ?
            ORDER BY CASE class WHEN 'external' THEN 0 ELSE 1 END, number
            "#,
        )
        .bind(automat.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(cell_from_row)
        .collect()
    }

    async fn get_cell(&self, id: CellId) -> Result<Option<LockerCell>> {
        sqlx::query(
            r#"
            SELECT id, parcel_automat_id, number, class, height, length, width, status
            FROM locker_cells WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(cell_from_row)
        .transpose()
    }

    async fn transition_cell(&self, id: CellId, from: CellStatus, to: CellStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE locker_cells SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_drone(&self, drone: Drone) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO drones
                (id, model, ip_address, status, battery_level, current_delivery, last_seen)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(drone.id.to_string())
        .bind(&*drone.model)
        .bind(&*drone.ip_address)
        .bind(drone.status.as_str())
        .bind(drone.battery_level as f64)
        .bind(text(drone.current_delivery))
        .bind(ms(drone.last_seen))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_drone(&self, id: DroneId) -> Result<Option<Drone>> {
        sqlx::query(
            r#"
            SELECT id, model, ip_address, status, battery_level, current_delivery, last_seen
            FROM drones WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(drone_from_row)
        .transpose()
    }

    async fn list_drones(&self) -> Result<Vec<Drone>> {
        sqlx::query(
            r#"
            SELECT id, model, ip_address, status, battery_level, current_delivery, last_seen
            FROM drones ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(drone_from_row)
        .collect()
    }

    async fn record_drone_status(
        &self,
        id: DroneId,
        status: DroneStatus,
        battery_level: f32,
        at: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE drones SET status = ?, battery_level = ?, last_seen = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(battery_level as f64)
        .bind(at.as_millisecond())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_drone(&self, id: DroneId, delivery: DeliveryId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drones SET current_delivery = ?
            WHERE id = ? AND status = 'idle' AND current_delivery IS NULL
            "#,
        )
        .bind(delivery.to_string())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_drone(&self, id: DroneId, delivery: DeliveryId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE drones SET current_delivery = NULL WHERE id = ? AND current_delivery = ?",
        )
        .bind(id.to_string())
        .bind(delivery.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_order(&self, order: Order) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(order.id.to_string())
        .bind(order.user_id.to_string())
        .bind(order.good_id.to_string())
        .bind(order.parcel_automat_id.to_string())
        .bind(text(order.locker_cell_id))
        .bind(text(order.internal_cell_id))
        .bind(order.status.as_str())
        .bind(order.created_at.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(order_from_row)
            .transpose()
    }

    async fn list_orders_by_user(&self, user: UserId) -> Result<Vec<Order>> {
        sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = ? ORDER BY created_at"
        ))
        .bind(user.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(order_from_row)
        .collect()
    }

    async fn find_order_by_cell(&self, cell: CellId, status: OrderStatus) -> Result<Option<Order>> {
        sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE locker_cell_id = ? AND status = ? LIMIT 1"
        ))
        .bind(cell.to_string())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(order_from_row)
        .transpose()
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE orders SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_delivery(&self, delivery: Delivery) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO deliveries ({DELIVERY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(delivery.id.to_string())
        .bind(delivery.order_id.to_string())
        .bind(text(delivery.drone_id))
        .bind(delivery.parcel_automat_id.to_string())
        .bind(delivery.locker_cell_id.to_string())
        .bind(text(delivery.internal_locker_cell_id))
        .bind(delivery.status.as_str())
        .bind(delivery.created_at.as_millisecond())
        .bind(ms(delivery.started_at))
        .bind(ms(delivery.cell_opened_at))
        .bind(ms(delivery.completed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(delivery_from_row)
        .transpose()
    }

    async fn get_delivery_by_order(&self, order: OrderId) -> Result<Option<Delivery>> {
        sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE order_id = ?"
        ))
        .bind(order.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(delivery_from_row)
        .transpose()
    }

    async fn list_deliveries_by_status(&self, status: DeliveryStatus) -> Result<Vec<Delivery>> {
        sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE status = ? ORDER BY created_at"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(delivery_from_row)
        .collect()
    }

    async fn update_delivery(&self, current: &Delivery, next: Delivery) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries SET
                drone_id = ?, internal_locker_cell_id = ?, status = ?,
                started_at = ?, cell_opened_at = ?, completed_at = ?
            WHERE id = ? AND status = ? AND drone_id IS ? AND internal_locker_cell_id IS ?
                AND started_at IS ? AND cell_opened_at IS ? AND completed_at IS ?
            "#,
        )
        .bind(text(next.drone_id))
        .bind(text(next.internal_locker_cell_id))
        .bind(next.status.as_str())
        .bind(ms(next.started_at))
        .bind(ms(next.cell_opened_at))
        .bind(ms(next.completed_at))
        .bind(current.id.to_string())
        .bind(current.status.as_str())
        .bind(text(current.drone_id))
        .bind(text(current.internal_locker_cell_id))
        .bind(ms(current.started_at))
        .bind(ms(current.cell_opened_at))
        .bind(ms(current.completed_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
