use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use skyport_core::http::ErrorResponse;
use tracing::warn;

use crate::actuator::ActuatorError;
use crate::orchestrator::OrchestratorError;
use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum LockerError {
    #[error("cell mapping not initialized")]
    NotInitialized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
    /// The orchestrator refused the scanned token or the request built from it.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Upstream(OrchestratorError),
}

impl From<RegistryError> for LockerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotInitialized => LockerError::NotInitialized,
            RegistryError::NumberNotFound { .. } | RegistryError::IdNotFound(_) => {
                LockerError::NotFound(err.to_string())
            }
            RegistryError::InvalidNumber(_) | RegistryError::DuplicateCell(_) => {
                LockerError::InvalidInput(err.to_string())
            }
        }
    }
}

impl From<OrchestratorError> for LockerError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Rejected { status, message, .. } if (400..500).contains(&status) => {
                LockerError::Validation(message)
            }
            other => LockerError::Upstream(other),
        }
    }
}

impl LockerError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            LockerError::NotInitialized => (StatusCode::CONFLICT, "not_initialized"),
            LockerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            LockerError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            LockerError::Actuator(_) => (StatusCode::INTERNAL_SERVER_ERROR, "actuator_fault"),
            LockerError::Validation(_) => (StatusCode::FORBIDDEN, "validation_failed"),
            LockerError::Upstream(_) => (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable"),
        }
    }
}

impl IntoResponse for LockerError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if let LockerError::Validation(reason) = &self {
            warn!(reason = "validation", detail = %reason, "scan rejected");
        }

        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
            error: Some(code.to_string()),
        };

        (status, Json(body)).into_response()
    }
}
