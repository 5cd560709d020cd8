pub mod http;
pub mod telemetry;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// `Box<str>` and `Box<[T]>` keep records compact; none of these values grow
// after construction.
type BoxStr = Box<str>;
type BoxList<T> = Box<[T]>;

macro_rules! impl_id {
    ($($name:ident),* $(,)?) => {
        $(
            impl $name {
                /// Generate a fresh random identifier.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Display::fmt(&self.0, f)
                }
            }

            impl FromStr for $name {
                type Err = uuid::Error;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Uuid::parse_str(s.trim()).map(Self)
                }
            }
        )*
    };
}

/// Unique identifier for a registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

/// Unique identifier for a stocked good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GoodId(pub Uuid);

/// Unique identifier for a parcel automat (one physical locker installation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AutomatId(pub Uuid);

/// Globally unique identifier of a locker cell, external or internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub Uuid);

/// Unique identifier for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub Uuid);

/// Unique identifier for the physical transport of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

/// Unique identifier for a drone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DroneId(pub Uuid);

impl_id!(UserId, GoodId, AutomatId, CellId, OrderId, DeliveryId, DroneId);

/// Error returned when a status string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    ($name:ident, $kind:literal { $($variant:ident => $text:literal),* $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)*
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Which side of the locker housing a cell opens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellClass {
    /// Customer-facing compartment.
    External,
    /// Machine-to-machine transfer door (drone drop chute).
    Internal,
}

str_enum!(CellClass, "cell class" {
    External => "external",
    Internal => "internal",
});

/// Physical size of a cell or a good, in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub height: u32,
    pub length: u32,
    pub width: u32,
}

impl Dimensions {
    pub const fn new(height: u32, length: u32, width: u32) -> Self {
        Self {
            height,
            length,
            width,
        }
    }

    /// Whether something of size `required` fits inside `self` without rotation.
    pub fn fits(&self, required: &Dimensions) -> bool {
        self.height >= required.height
            && self.length >= required.length
            && self.width >= required.width
    }

    pub fn volume(&self) -> u64 {
        self.height as u64 * self.length as u64 * self.width as u64
    }
}

/// Authoritative status of a locker cell, owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Available,
    /// Held for an order that has not been dropped off yet.
    Reserved,
    /// Holds a parcel waiting for pickup.
    Occupied,
    Maintenance,
}

str_enum!(CellStatus, "cell status" {
    Available => "available",
    Reserved => "reserved",
    Occupied => "occupied",
    Maintenance => "maintenance",
});

/// A single compartment of a parcel automat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockerCell {
    pub id: CellId,
    pub parcel_automat_id: AutomatId,
    /// Physical number, dense `1..=N` within its class.
    pub number: u32,
    pub class: CellClass,
    pub dimensions: Dimensions,
    pub status: CellStatus,
}

/// One physical locker installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelAutomat {
    pub id: AutomatId,
    /// Street address shown to users.
    pub address: BoxStr,
    /// Base URL of the locker agent running on this automat.
    pub agent_url: BoxStr,
    /// Number of external cells.
    pub number_of_cells: u32,
    /// Visual landing marker the drones navigate to.
    pub aruco_id: u32,
    pub is_working: bool,
}

/// A user of the platform, subject of identity tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: BoxStr,
    pub name: BoxStr,
    /// Issue time of the most recent identity token.
    pub token_issued_at: Option<jiff::Timestamp>,
    /// Expiry of the most recent identity token.
    pub token_expires_at: Option<jiff::Timestamp>,
}

/// An item kept in inventory and shipped to lockers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Good {
    pub id: GoodId,
    pub name: BoxStr,
    /// Weight in grams.
    pub weight: u32,
    pub dimensions: Dimensions,
    pub quantity_available: u32,
}

/// Lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    CellReserved,
    DroneAssigned,
    InTransit,
    Delivered,
    PickedUp,
    Cancelled,
    Failed,
}

str_enum!(OrderStatus, "order status" {
    Created => "created",
    CellReserved => "cell_reserved",
    DroneAssigned => "drone_assigned",
    InTransit => "in_transit",
    Delivered => "delivered",
    PickedUp => "picked_up",
    Cancelled => "cancelled",
    Failed => "failed",
});

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PickedUp | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub good_id: GoodId,
    pub parcel_automat_id: AutomatId,
    /// External cell reserved for this order.
    pub locker_cell_id: Option<CellId>,
    /// Internal door reserved for the drop-off, if the automat has a free one.
    pub internal_cell_id: Option<CellId>,
    pub status: OrderStatus,
    pub created_at: jiff::Timestamp,
}

/// Lifecycle of the physical transport of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    AwaitingDrone,
    InTransit,
    Delivered,
    Failed,
    Cancelled,
}

str_enum!(DeliveryStatus, "delivery status" {
    Pending => "pending",
    AwaitingDrone => "awaiting_drone",
    InTransit => "in_transit",
    Delivered => "delivered",
    Failed => "failed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub order_id: OrderId,
    /// Assigned when a drone is claimed; never reassigned mid-flight.
    pub drone_id: Option<DroneId>,
    pub parcel_automat_id: AutomatId,
    pub locker_cell_id: CellId,
    pub internal_locker_cell_id: Option<CellId>,
    pub status: DeliveryStatus,
    pub created_at: jiff::Timestamp,
    pub started_at: Option<jiff::Timestamp>,
    /// Set once the locker agent confirmed it opened the drop-off cell.
    pub cell_opened_at: Option<jiff::Timestamp>,
    pub completed_at: Option<jiff::Timestamp>,
}

/// Flight status as reported by drone telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DroneStatus {
    Idle,
    TakingOff,
    PickingUp,
    InTransit,
    Delivering,
    Returning,
    Landing,
    Charging,
    Error,
    Maintenance,
}

str_enum!(DroneStatus, "drone status" {
    Idle => "idle",
    TakingOff => "taking_off",
    PickingUp => "picking_up",
    InTransit => "in_transit",
    Delivering => "delivering",
    Returning => "returning",
    Landing => "landing",
    Charging => "charging",
    Error => "error",
    Maintenance => "maintenance",
});

/// A drone registered with the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drone {
    pub id: DroneId,
    pub model: BoxStr,
    pub ip_address: BoxStr,
    /// Latest status reported through telemetry.
    pub status: DroneStatus,
    /// Battery charge in percent.
    pub battery_level: f32,
    /// Delivery this drone is claimed for, if any.
    pub current_delivery: Option<DeliveryId>,
    pub last_seen: Option<jiff::Timestamp>,
}

/// Geographic position reported by a drone.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// Unit of work handed from the orchestrator to the drone service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub delivery_id: DeliveryId,
    pub order_id: OrderId,
    pub good_id: GoodId,
    pub drone_id: DroneId,
    pub parcel_automat_id: AutomatId,
    /// Landing marker of the destination automat.
    pub aruco_id: u32,
    pub locker_cell_id: CellId,
    pub internal_locker_cell_id: Option<CellId>,
    pub dimensions: Dimensions,
}

/// Ask the orchestrator to open the drop-off cell for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOpenRequest {
    pub order_id: OrderId,
    pub parcel_automat_id: AutomatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOpenResponse {
    pub success: bool,
    pub message: BoxStr,
    pub cell_id: Option<CellId>,
    pub internal_cell_id: Option<CellId>,
}

/// Fetch queued delivery tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollTasksRequest {
    /// Upper bound on the number of tasks returned.
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollTasksResponse {
    pub tasks: BoxList<DeliveryTask>,
    /// Deliveries cancelled since the last poll.
    pub cancelled: BoxList<CancelledDelivery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledDelivery {
    pub delivery_id: DeliveryId,
    pub order_id: OrderId,
    pub drone_id: DroneId,
}

/// Progress of a delivery as observed by the drone service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// The drone took off with the parcel.
    InTransit,
    /// The drone released the parcel into the opened cell.
    CargoDropped { locker_cell_id: Option<CellId> },
    /// The delivery cannot be completed.
    Failed { reason: BoxStr },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEventRequest {
    pub order_id: OrderId,
    pub drone_id: DroneId,
    pub event: DeliveryEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEventResponse {
    /// Order status after the event was applied.
    pub order_status: OrderStatus,
}

/// Latest telemetry of one drone, forwarded to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DroneStatusReport {
    pub drone_id: DroneId,
    pub status: DroneStatus,
    pub battery_level: f32,
    pub timestamp: jiff::Timestamp,
}
