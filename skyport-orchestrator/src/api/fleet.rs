//! Inventory and drone registration.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use skyport_core::http::ApiResponse;
use skyport_core::{Drone, Good};

use super::error::ApiError;
use super::models::{DroneCreateRequest, GoodCreateRequest, ok};
use super::parse_id;
use crate::AppState;
use crate::agent::LockerAgent;
use crate::coordinator::{NewDrone, NewGood};
use crate::store::Store;

pub async fn create_good<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Json(request): Json<GoodCreateRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Good>>), ApiError> {
    let good = state
        .coordinator
        .register_good(NewGood {
            name: request.name,
            weight: request.weight,
            dimensions: request.dimensions,
            quantity: request.quantity_available,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(ok(good))))
}

pub async fn get_good<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Good>>, ApiError> {
    let good = state.coordinator.get_good(parse_id(&id)?).await?;
    Ok(Json(ok(good)))
}

pub async fn create_drone<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Json(request): Json<DroneCreateRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Drone>>), ApiError> {
    let drone = state
        .coordinator
        .register_drone(NewDrone {
            model: request.model,
            ip_address: request.ip_address,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(ok(drone))))
}

pub async fn list_drones<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
) -> Result<Json<ApiResponse<Vec<Drone>>>, ApiError> {
    Ok(Json(ok(state.coordinator.list_drones().await?)))
}
