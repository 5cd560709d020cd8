use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use skyport_core::ParcelAutomat;
use skyport_core::http::{
    ApiResponse, ConfirmPickupRequest, ConfirmPickupResponse, OpenCellResponse,
    ScanValidationRequest, ScanValidationResponse, SyncCellsResponse,
};

use super::error::ApiError;
use super::models::{AutomatCreateRequest, AutomatResponse, PrepareRequest, ok, ok_with};
use super::parse_id;
use crate::AppState;
use crate::agent::LockerAgent;
use crate::coordinator::NewAutomat;
use crate::store::Store;

pub async fn create_automat<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Json(request): Json<AutomatCreateRequest>,
) -> Result<(StatusCode, Json<ApiResponse<AutomatResponse>>), ApiError> {
    let (automat, cells) = state
        .coordinator
        .create_automat(NewAutomat {
            address: request.address,
            agent_url: request.agent_url,
            number_of_cells: request.number_of_cells,
            aruco_id: request.aruco_id,
            internal_doors: request.internal_doors,
            cell_dimensions: request.cell_dimensions,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ok(AutomatResponse { automat, cells })),
    ))
}

pub async fn list_automats<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
) -> Result<Json<ApiResponse<Vec<ParcelAutomat>>>, ApiError> {
    Ok(Json(ok(state.coordinator.list_automats().await?)))
}

pub async fn get_automat<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AutomatResponse>>, ApiError> {
    let (automat, cells) = state.coordinator.get_automat(parse_id(&id)?).await?;
    Ok(Json(ok(AutomatResponse { automat, cells })))
}

/// Push the cell mapping to the automat's agent.
pub async fn sync_automat<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<SyncCellsResponse>>, ApiError> {
    let synced = state.coordinator.sync_automat(parse_id(&id)?).await?;
    Ok(Json(ok_with(synced, "cell mapping synced")))
}

pub async fn prepare_cell<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
    Json(request): Json<PrepareRequest>,
) -> Result<Json<ApiResponse<OpenCellResponse>>, ApiError> {
    let opened = state
        .coordinator
        .prepare_cell(parse_id(&id)?, request.cell_id)
        .await?;
    Ok(Json(ok(opened)))
}

/// Called by a locker agent with a scanned token.
pub async fn validate_scan<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Json(request): Json<ScanValidationRequest>,
) -> Result<Json<ApiResponse<ScanValidationResponse>>, ApiError> {
    let cell_ids = state
        .coordinator
        .process_scan(&request.qr_data, request.parcel_automat_id)
        .await?;

    Ok(Json(ok(ScanValidationResponse {
        success: true,
        message: format!("{} cell(s) ready for pickup", cell_ids.len()),
        cell_ids,
    })))
}

pub async fn confirm_pickup<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Json(request): Json<ConfirmPickupRequest>,
) -> Result<Json<ApiResponse<ConfirmPickupResponse>>, ApiError> {
    let confirmed = state.coordinator.confirm_pickup(&request.cell_ids).await?;
    Ok(Json(ok(confirmed)))
}
