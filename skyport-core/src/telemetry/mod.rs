//! Messages exchanged between drones and the drone service.
//!
//! Every frame is one line of JSON shaped `{"type": ..., "payload": ...}`.

mod error;

pub use error::TelemetryError;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AutomatId, CellId, DeliveryId, DeliveryTask, DroneId, DroneStatus, OrderId, Position};

/// Periodic state report of a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroneReport {
    pub status: DroneStatus,
    /// Battery charge in percent.
    pub battery_level: f32,
    #[serde(default)]
    pub position: Position,
    /// Ground speed in m/s.
    #[serde(default)]
    pub speed: f32,
    #[serde(default)]
    pub current_delivery_id: Option<DeliveryId>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Frames sent by a drone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DroneMessage {
    /// First frame on a connection, identifying the drone.
    Hello { drone_id: DroneId },
    Heartbeat(DroneReport),
    StatusUpdate(DroneReport),
    DeliveryUpdate {
        drone_status: DroneStatus,
        delivery_id: DeliveryId,
        order_id: OrderId,
        parcel_automat_id: Option<AutomatId>,
    },
    ArrivedAtDestination {
        order_id: OrderId,
        parcel_automat_id: AutomatId,
    },
    CargoDropped {
        order_id: OrderId,
        locker_cell_id: Option<CellId>,
    },
    /// Camera frame, forwarded without inspection.
    VideoFrame(Value),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct HelloPayload {
    drone_id: DroneId,
}

#[derive(Deserialize)]
struct DeliveryUpdatePayload {
    drone_status: DroneStatus,
    delivery_id: DeliveryId,
    order_id: OrderId,
    #[serde(default)]
    parcel_automat_id: Option<AutomatId>,
}

#[derive(Deserialize)]
struct ArrivedPayload {
    order_id: OrderId,
    parcel_automat_id: AutomatId,
}

#[derive(Deserialize)]
struct CargoDroppedPayload {
    order_id: OrderId,
    #[serde(default)]
    locker_cell_id: Option<CellId>,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, TelemetryError> {
    serde_json::from_value(value).map_err(|source| TelemetryError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

impl DroneMessage {
    /// Parse one frame, rejecting unknown `type` tags explicitly.
    pub fn decode(line: &str) -> Result<Self, TelemetryError> {
        let RawFrame { kind, payload: body } =
            serde_json::from_str(line).map_err(TelemetryError::Malformed)?;

        let message = match kind.as_str() {
            "hello" => {
                let p: HelloPayload = payload(&kind, body)?;
                DroneMessage::Hello {
                    drone_id: p.drone_id,
                }
            }
            "heartbeat" => DroneMessage::Heartbeat(payload(&kind, body)?),
            "status_update" => DroneMessage::StatusUpdate(payload(&kind, body)?),
            "delivery_update" => {
                let p: DeliveryUpdatePayload = payload(&kind, body)?;
                DroneMessage::DeliveryUpdate {
                    drone_status: p.drone_status,
                    delivery_id: p.delivery_id,
                    order_id: p.order_id,
                    parcel_automat_id: p.parcel_automat_id,
                }
            }
            "arrived_at_destination" => {
                let p: ArrivedPayload = payload(&kind, body)?;
                DroneMessage::ArrivedAtDestination {
                    order_id: p.order_id,
                    parcel_automat_id: p.parcel_automat_id,
                }
            }
            "cargo_dropped" => {
                let p: CargoDroppedPayload = payload(&kind, body)?;
                DroneMessage::CargoDropped {
                    order_id: p.order_id,
                    locker_cell_id: p.locker_cell_id,
                }
            }
            "video_frame" => DroneMessage::VideoFrame(body),
            _ => return Err(TelemetryError::UnknownMessageType(kind)),
        };

        Ok(message)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DroneMessage::Hello { .. } => "hello",
            DroneMessage::Heartbeat(_) => "heartbeat",
            DroneMessage::StatusUpdate(_) => "status_update",
            DroneMessage::DeliveryUpdate { .. } => "delivery_update",
            DroneMessage::ArrivedAtDestination { .. } => "arrived_at_destination",
            DroneMessage::CargoDropped { .. } => "cargo_dropped",
            DroneMessage::VideoFrame(_) => "video_frame",
        }
    }
}

/// Manual flight adjustments an operator may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Hold,
    Resume,
    Land,
}

/// Frames sent to a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DroneCommand {
    StartDelivery(DeliveryTask),
    DropCargo {
        order_id: OrderId,
        cell_id: CellId,
        internal_cell_id: Option<CellId>,
    },
    CancelDelivery {
        delivery_id: DeliveryId,
    },
    ReturnToBase {
        delivery_id: Option<DeliveryId>,
        base_marker_id: u32,
    },
    Control {
        action: ControlAction,
    },
}

impl DroneCommand {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_arrival() {
        let order_id = OrderId::new();
        let automat_id = AutomatId::new();
        let line = format!(
            r#"{{"type":"arrived_at_destination","payload":{{"order_id":"{order_id}","parcel_automat_id":"{automat_id}"}}}}"#
        );

        let message = DroneMessage::decode(&line).unwrap();

        assert_eq!(
            message,
            DroneMessage::ArrivedAtDestination {
                order_id,
                parcel_automat_id: automat_id,
            }
        );
    }

    #[test]
    fn rejects_unknown_type() {
        let err = DroneMessage::decode(r#"{"type":"barrel_roll","payload":{}}"#).unwrap_err();
        assert!(matches!(err, TelemetryError::UnknownMessageType(kind) if kind == "barrel_roll"));
    }

    #[test]
    fn missing_field_is_invalid_payload() {
        let err = DroneMessage::decode(r#"{"type":"cargo_dropped","payload":{}}"#).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidPayload { .. }));
    }

    #[test]
    fn encoded_reports_decode_back() {
        let message = DroneMessage::StatusUpdate(DroneReport {
            status: DroneStatus::Returning,
            battery_level: 41.5,
            position: Position {
                lat: 55.75,
                lon: 37.61,
                alt: 120.0,
            },
            speed: 12.0,
            current_delivery_id: None,
            error_message: None,
        });

        let line = message.encode().unwrap();
        assert_eq!(DroneMessage::decode(&line).unwrap(), message);
    }

    #[test]
    fn commands_use_type_and_payload() {
        let json = DroneCommand::Control {
            action: ControlAction::Hold,
        }
        .encode()
        .unwrap();
        assert_eq!(json, r#"{"type":"control","payload":{"action":"hold"}}"#);
    }
}
