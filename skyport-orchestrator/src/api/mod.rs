pub mod automats;
pub mod error;
pub mod fleet;
pub mod models;
pub mod orders;
pub mod users;

use std::str::FromStr;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use self::error::ApiError;
use crate::AppState;
use crate::agent::LockerAgent;
use crate::store::Store;

fn parse_id<T: FromStr>(raw: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid id {raw:?}, expected a UUID")))
}

/// Routes of the public API, mounted under `/api/v1`.
pub fn router<S: Store, A: LockerAgent>() -> Router<AppState<S, A>> {
    Router::new()
        // Users
        .route("/users", post(users::create_user::<S, A>))
        .route("/users/{id}", get(users::get_user::<S, A>))
        .route(
            "/users/{id}/token",
            get(users::get_token::<S, A>).post(users::issue_token::<S, A>),
        )
        .route("/users/{id}/orders", get(users::list_orders::<S, A>))
        // Inventory and fleet
        .route("/goods", post(fleet::create_good::<S, A>))
        .route("/goods/{id}", get(fleet::get_good::<S, A>))
        .route(
            "/drones",
            get(fleet::list_drones::<S, A>).post(fleet::create_drone::<S, A>),
        )
        // Parcel automats
        .route(
            "/automats",
            get(automats::list_automats::<S, A>).post(automats::create_automat::<S, A>),
        )
        .route("/automats/qr-scan", post(automats::validate_scan::<S, A>))
        .route(
            "/automats/confirm-pickup",
            post(automats::confirm_pickup::<S, A>),
        )
        .route("/automats/{id}", get(automats::get_automat::<S, A>))
        .route("/automats/{id}/sync", post(automats::sync_automat::<S, A>))
        .route(
            "/automats/{id}/prepare",
            post(automats::prepare_cell::<S, A>),
        )
        // Orders and deliveries
        .route("/orders", post(orders::create_order::<S, A>))
        .route("/orders/{id}", get(orders::get_order::<S, A>))
        .route("/orders/{id}/cancel", post(orders::cancel_order::<S, A>))
        .route(
            "/orders/{id}/pickup-token",
            post(orders::pickup_token::<S, A>),
        )
        .route(
            "/deliveries/confirm-loaded",
            post(orders::confirm_loaded::<S, A>),
        )
        .route("/deliveries/{id}", get(orders::get_delivery::<S, A>))
}

async fn health() -> &'static str {
    "OK"
}

/// The complete HTTP application.
pub fn app<S: Store, A: LockerAgent>(state: AppState<S, A>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", router::<S, A>())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
