use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde_json::{Value, json};
use skyport_core::http::{
    ConfirmLoadedRequest, ConfirmPickupRequest, ConfirmPickupResponse, OpenCellRequest,
    OpenCellResponse, PrepareCellRequest, ScanRequest, ScanResponse, SyncCellsRequest,
    SyncCellsResponse,
};
use tower_http::trace::TraceLayer;

use crate::actuator::Actuator;
use crate::cells::{CellCount, CellManager};
use crate::error::LockerError;
use crate::orchestrator::Orchestrator;
use crate::pickup::PickupService;
use crate::registry::CellMapping;

pub struct AppState<A, O> {
    pub cells: CellManager<A>,
    pub pickup: PickupService<A, O>,
}

impl<A, O> Clone for AppState<A, O> {
    fn clone(&self) -> Self {
        Self {
            cells: self.cells.clone(),
            pickup: self.pickup.clone(),
        }
    }
}

pub fn router<A: Actuator, O: Orchestrator>(state: AppState<A, O>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/cells/sync", post(sync_cells::<A, O>))
        .route("/api/cells/mapping", get(mapping::<A, O>))
        .route("/api/cells/count", get(count::<A, O>))
        .route("/api/cells/prepare", post(prepare_cell::<A, O>))
        .route("/api/cells/{number}/open", post(open_cell::<A, O>))
        .route(
            "/api/cells/internal/{number}/open",
            post(open_internal::<A, O>),
        )
        .route("/api/qr/scan", post(scan::<A, O>))
        .route("/api/qr/confirm-pickup", post(confirm_pickup::<A, O>))
        .route("/api/qr/confirm-loaded", post(confirm_loaded::<A, O>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn sync_cells<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
    Json(request): Json<SyncCellsRequest>,
) -> Result<Json<SyncCellsResponse>, LockerError> {
    let summary = state.cells.sync(&request).await?;

    Ok(Json(SyncCellsResponse {
        success: true,
        parcel_automat_id: summary.parcel_automat_id,
        external_count: summary.external_count,
        internal_count: summary.internal_count,
    }))
}

async fn mapping<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
) -> Json<CellMapping> {
    Json(state.cells.mapping().await)
}

async fn count<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
) -> Json<CellCount> {
    Json(state.cells.count().await)
}

async fn open_cell<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
    Path(number): Path<u32>,
    body: Option<Json<OpenCellRequest>>,
) -> Result<Json<OpenCellResponse>, LockerError> {
    let order_number = body.and_then(|Json(b)| b.order_number);
    let response = state
        .cells
        .open_cell(number, order_number.as_deref())
        .await?;
    Ok(Json(response))
}

async fn open_internal<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
    Path(number): Path<u32>,
    body: Option<Json<OpenCellRequest>>,
) -> Result<Json<OpenCellResponse>, LockerError> {
    let order_number = body.and_then(|Json(b)| b.order_number);
    let response = state
        .cells
        .open_internal(number, order_number.as_deref())
        .await?;
    Ok(Json(response))
}

async fn prepare_cell<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
    Json(request): Json<PrepareCellRequest>,
) -> Result<Json<OpenCellResponse>, LockerError> {
    Ok(Json(state.cells.prepare(&request.cell_id).await?))
}

async fn scan<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, LockerError> {
    if request.qr_data.trim().is_empty() {
        return Err(LockerError::InvalidInput("qr_data is empty".to_string()));
    }
    Ok(Json(state.pickup.process_scan(&request.qr_data).await?))
}

async fn confirm_pickup<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
    Json(request): Json<ConfirmPickupRequest>,
) -> Result<Json<ConfirmPickupResponse>, LockerError> {
    Ok(Json(state.pickup.confirm_pickup(&request.cell_ids).await?))
}

async fn confirm_loaded<A: Actuator, O: Orchestrator>(
    State(state): State<AppState<A, O>>,
    Json(request): Json<ConfirmLoadedRequest>,
) -> Result<Json<Value>, LockerError> {
    state
        .pickup
        .confirm_loaded(request.order_id, request.locker_cell_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "order_id": request.order_id,
        "cell_id": request.locker_cell_id,
    })))
}
