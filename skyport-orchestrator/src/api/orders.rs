use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use skyport_core::http::{ApiResponse, ConfirmLoadedRequest};
use skyport_core::{Delivery, Order};

use super::error::ApiError;
use super::models::{ConfirmLoadedResponse, OrderCreateRequest, TokenResponse, ok, ok_with};
use super::parse_id;
use crate::AppState;
use crate::agent::LockerAgent;
use crate::store::Store;

pub async fn create_order<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Json(request): Json<OrderCreateRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Order>>), ApiError> {
    let order = state
        .coordinator
        .create_order(request.user_id, request.good_id, request.parcel_automat_id)
        .await?;
    Ok((StatusCode::CREATED, Json(ok(order))))
}

pub async fn get_order<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    Ok(Json(ok(state.coordinator.get_order(parse_id(&id)?).await?)))
}

pub async fn cancel_order<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let order = state.coordinator.cancel_order(parse_id(&id)?).await?;
    Ok(Json(ok_with(order, "order cancelled")))
}

pub async fn pickup_token<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    let issued = state
        .coordinator
        .issue_pickup_token(parse_id(&id)?)
        .await?;
    Ok(Json(ok(issued.into())))
}

pub async fn get_delivery<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Delivery>>, ApiError> {
    Ok(Json(ok(state.coordinator.get_delivery(parse_id(&id)?).await?)))
}

/// Called by a locker agent after a parcel went in through an internal door.
pub async fn confirm_loaded<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Json(request): Json<ConfirmLoadedRequest>,
) -> Result<Json<ApiResponse<ConfirmLoadedResponse>>, ApiError> {
    let order_status = state
        .coordinator
        .confirm_loaded(request.order_id, request.locker_cell_id)
        .await?;
    Ok(Json(ok(ConfirmLoadedResponse {
        order_id: request.order_id,
        order_status,
    })))
}
