use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use skyport_core::DroneId;
use skyport_core::http::{ApiResponse, ErrorResponse};
use skyport_core::telemetry::{ControlAction, DroneCommand};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::fleet::{DroneView, Fleet, FleetError};

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

pub fn router(fleet: Fleet) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/drones", get(list_drones))
        .route("/drones/{id}", get(get_drone))
        .route("/drones/{id}/control", post(control))
        .layer(TraceLayer::new_for_http())
        .with_state(fleet)
}

async fn health() -> &'static str {
    "OK"
}

fn ok<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        message: None,
    })
}

fn failure(status: StatusCode, error: &str, message: String) -> Response {
    let body = ErrorResponse {
        success: false,
        message,
        error: Some(error.to_string()),
    };
    (status, Json(body)).into_response()
}

fn parse_drone(raw: &str) -> Result<DroneId, Response> {
    raw.parse().map_err(|_| {
        failure(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            format!("invalid drone id: {raw}"),
        )
    })
}

async fn list_drones(State(fleet): State<Fleet>) -> Json<ApiResponse<Vec<DroneView>>> {
    ok(fleet.snapshot())
}

async fn get_drone(State(fleet): State<Fleet>, Path(id): Path<String>) -> Response {
    let drone_id = match parse_drone(&id) {
        Ok(drone_id) => drone_id,
        Err(response) => return response,
    };
    match fleet.get(drone_id) {
        Some(view) => ok(view).into_response(),
        None => failure(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("drone {drone_id} has never connected"),
        ),
    }
}

async fn control(
    State(fleet): State<Fleet>,
    Path(id): Path<String>,
    Json(request): Json<ControlRequest>,
) -> Response {
    let drone_id = match parse_drone(&id) {
        Ok(drone_id) => drone_id,
        Err(response) => return response,
    };
    let command = DroneCommand::Control {
        action: request.action,
    };

    match fleet.send(drone_id, command) {
        Ok(()) => {
            info!(%drone_id, action = ?request.action, "Control command sent");
            ok(request.action).into_response()
        }
        Err(e @ FleetError::NotConnected(_)) => {
            failure(StatusCode::NOT_FOUND, "not_found", e.to_string())
        }
        Err(e) => failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "upstream_unavailable",
            e.to_string(),
        ),
    }
}
