use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use skyport_core::http::ApiResponse;
use skyport_core::{Order, User};

use super::error::ApiError;
use super::models::{TokenResponse, UserCreateRequest, ok, ok_with};
use super::parse_id;
use crate::AppState;
use crate::agent::LockerAgent;
use crate::store::Store;

pub async fn create_user<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Json(request): Json<UserCreateRequest>,
) -> Result<(StatusCode, Json<ApiResponse<User>>), ApiError> {
    let user = state
        .coordinator
        .register_user(&request.email, &request.name)
        .await?;
    Ok((StatusCode::CREATED, Json(ok(user))))
}

pub async fn get_user<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<User>>, ApiError> {
    let user = state.coordinator.get_user(parse_id(&id)?).await?;
    Ok(Json(ok(user)))
}

/// Sign a new identity token. Earlier tokens stay valid until they expire.
pub async fn issue_token<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    let issued = state
        .coordinator
        .issue_identity_token(parse_id(&id)?)
        .await?;
    Ok(Json(ok_with(issued.into(), "identity token issued")))
}

/// The user's current identity token, re-issued if it has expired.
pub async fn get_token<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    let issued = state
        .coordinator
        .current_identity_token(parse_id(&id)?)
        .await?;
    Ok(Json(ok(issued.into())))
}

pub async fn list_orders<S: Store, A: LockerAgent>(
    State(state): State<AppState<S, A>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<Order>>>, ApiError> {
    let orders = state.coordinator.list_orders(parse_id(&id)?).await?;
    Ok(Json(ok(orders)))
}
