//! RPC surface used by the drone service.

use skyport_core::DeliveryEventResponse;
use skyport_rpc::{Server, WireError, WireErrorCode, WireMessage};
use tokio::net::TcpListener;
use tracing::warn;

use crate::agent::LockerAgent;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::store::Store;

/// Upper bound on tasks handed out by one poll.
const MAX_TASKS_PER_POLL: u32 = 64;

impl From<&CoordinatorError> for WireErrorCode {
    fn from(err: &CoordinatorError) -> Self {
        match err {
            CoordinatorError::NotFound(_) => WireErrorCode::NotFound,
            CoordinatorError::InvalidInput(_) | CoordinatorError::Validation(_) => {
                WireErrorCode::InvalidInput
            }
            CoordinatorError::UserMismatch
            | CoordinatorError::Conflict(_)
            | CoordinatorError::NoAvailableCell
            | CoordinatorError::NoOrdersForPickup
            | CoordinatorError::CellOpenFailed(_) => WireErrorCode::Conflict,
            CoordinatorError::Upstream(_) => WireErrorCode::Unavailable,
            CoordinatorError::Storage(_) => WireErrorCode::Internal,
        }
    }
}

fn wire_error(op: &'static str, err: CoordinatorError) -> WireMessage {
    warn!(op, error = %err, "drone service request failed");
    WireMessage::Error(WireError::new(WireErrorCode::from(&err), err.to_string()))
}

/// Build the RPC server answering drone service requests from `coordinator`.
pub fn server<S: Store, A: LockerAgent>(
    listener: TcpListener,
    coordinator: Coordinator<S, A>,
) -> Server {
    let open = coordinator.clone();
    let poll = coordinator.clone();
    let event = coordinator.clone();
    let status = coordinator;

    Server::new(listener)
        .on_cell_open(move |request| {
            let coordinator = open.clone();
            async move {
                match coordinator.open_cell_for_drop(request).await {
                    Ok(response) => WireMessage::CellOpenResponse(response),
                    Err(e) => wire_error("cell_open", e),
                }
            }
        })
        .on_poll_tasks(move |request| {
            let coordinator = poll.clone();
            async move {
                let max = request.max.clamp(1, MAX_TASKS_PER_POLL);
                WireMessage::PollTasksResponse(coordinator.poll_tasks(max).await)
            }
        })
        .on_delivery_event(move |request| {
            let coordinator = event.clone();
            async move {
                match coordinator.delivery_event(request).await {
                    Ok(order_status) => {
                        WireMessage::DeliveryEventResponse(DeliveryEventResponse { order_status })
                    }
                    Err(e) => wire_error("delivery_event", e),
                }
            }
        })
        .on_drone_status(move |report| {
            let coordinator = status.clone();
            async move {
                match coordinator.record_drone_status(report).await {
                    Ok(()) => WireMessage::DroneStatusAck,
                    Err(e) => wire_error("drone_status", e),
                }
            }
        })
}
