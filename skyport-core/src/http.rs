//! JSON bodies exchanged over HTTP between the orchestrator and locker agents.

use serde::{Deserialize, Serialize};

use crate::{AutomatId, CellClass, CellId, OrderId};

/// Envelope used by every successful JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

/// Body returned alongside a non-2xx status code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    /// Machine-readable error class, e.g. `not_found` or `not_initialized`.
    pub error: Option<String>,
}

/// Full replacement of an agent's cell mapping.
///
/// Identifiers travel as strings so that the agent can report malformed ones
/// itself instead of rejecting the whole body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCellsRequest {
    pub parcel_automat_id: String,
    pub external_cell_ids: Vec<String>,
    pub internal_cell_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCellsResponse {
    pub success: bool,
    pub parcel_automat_id: AutomatId,
    pub external_count: usize,
    pub internal_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenCellRequest {
    /// Correlation reference shown on the locker display.
    #[serde(default)]
    pub order_number: Option<String>,
}

/// What the agent did to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellAction {
    Opened,
    InternalOpened,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenCellResponse {
    pub success: bool,
    pub cell_number: u32,
    pub cell_id: CellId,
    pub class: CellClass,
    pub action: CellAction,
    /// Acknowledgement string reported by the actuator.
    pub actuator_status: String,
}

/// Open a cell by identifier, routed to the external or internal bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareCellRequest {
    pub cell_id: String,
}

/// Raw token scanned at the locker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub qr_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub success: bool,
    pub message: String,
    pub cells_opened: Vec<CellId>,
    pub cell_count: usize,
}

/// Token forwarded by an agent to the orchestrator for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanValidationRequest {
    pub qr_data: String,
    pub parcel_automat_id: AutomatId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanValidationResponse {
    pub success: bool,
    pub message: String,
    /// Cells the scanning user may open.
    pub cell_ids: Vec<CellId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmPickupRequest {
    pub cell_ids: Vec<CellId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmPickupResponse {
    pub success: bool,
    pub message: String,
    pub confirmed: Vec<CellId>,
    pub failed: Vec<CellId>,
}

/// A parcel was loaded into a cell through an internal door.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfirmLoadedRequest {
    pub order_id: OrderId,
    #[serde(alias = "cell_id")]
    pub locker_cell_id: CellId,
}
