use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use skyport_core::http::ErrorResponse;
use tracing::{error, warn};

use crate::coordinator::CoordinatorError;
use crate::token::TokenError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Coordinator(CoordinatorError),
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        ApiError::Coordinator(err)
    }
}

fn status_and_code(err: &CoordinatorError) -> (StatusCode, &'static str) {
    match err {
        CoordinatorError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        CoordinatorError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        CoordinatorError::Validation(TokenError::Expired) => {
            (StatusCode::UNAUTHORIZED, "token_expired")
        }
        CoordinatorError::Validation(_) => (StatusCode::UNAUTHORIZED, "invalid_token"),
        CoordinatorError::UserMismatch => (StatusCode::UNAUTHORIZED, "user_mismatch"),
        CoordinatorError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        CoordinatorError::NoAvailableCell => (StatusCode::CONFLICT, "no_available_cell"),
        CoordinatorError::NoOrdersForPickup => (StatusCode::NOT_FOUND, "no_orders_for_pickup"),
        CoordinatorError::CellOpenFailed(_) => (StatusCode::BAD_GATEWAY, "cell_open_failed"),
        CoordinatorError::Upstream(_) => (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable"),
        CoordinatorError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg),
            ApiError::Coordinator(err) => {
                let (status, code) = status_and_code(&err);
                let message = match &err {
                    CoordinatorError::Storage(source) => {
                        error!(error = %source, "storage failure");
                        "internal error".to_string()
                    }
                    CoordinatorError::Validation(_) | CoordinatorError::UserMismatch => {
                        warn!(reason = "validation", error = %err, "request rejected");
                        err.to_string()
                    }
                    _ => err.to_string(),
                };
                (status, code, message)
            }
        };

        let body = ErrorResponse {
            success: false,
            message,
            error: Some(code.to_string()),
        };
        (status, Json(body)).into_response()
    }
}
