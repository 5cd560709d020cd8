use serde::{Deserialize, Serialize};
use skyport_core::{
    CellOpenRequest, CellOpenResponse, DeliveryEventRequest, DeliveryEventResponse,
    DroneStatusReport, PollTasksRequest, PollTasksResponse,
};
use ulid::Ulid;

/// Correlates a reply with the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// A single frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: MessageId,
    /// Set on replies to the id of the originating request.
    pub reply_to: Option<MessageId>,
    pub payload: WireMessage,
}

/// Error class carried by [`WireMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorCode {
    NotFound,
    InvalidInput,
    Conflict,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: WireErrorCode,
    pub message: Box<str>,
}

impl WireError {
    pub fn new(code: WireErrorCode, message: impl Into<Box<str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Ping,
    Pong,
    CellOpenRequest(CellOpenRequest),
    CellOpenResponse(CellOpenResponse),
    PollTasksRequest(PollTasksRequest),
    PollTasksResponse(PollTasksResponse),
    DeliveryEventRequest(DeliveryEventRequest),
    DeliveryEventResponse(DeliveryEventResponse),
    DroneStatusReport(DroneStatusReport),
    DroneStatusAck,
    Error(WireError),
}
