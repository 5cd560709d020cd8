use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use skyport_core::http::{
    ApiResponse, ConfirmLoadedRequest, ConfirmPickupRequest, ConfirmPickupResponse, ErrorResponse,
    ScanValidationRequest, ScanValidationResponse,
};
use skyport_core::{AutomatId, CellId, OrderId};
use skyport_rpc::{CancellationToken, RetryError, RetryPolicy, Retryable};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
    #[error("orchestrator rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("request cancelled")]
    Cancelled,
}

/// Calls the locker agent makes to the orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    /// Forward a scanned token; returns the cells the holder may open.
    async fn validate_scan(
        &self,
        qr_data: &str,
        parcel_automat_id: AutomatId,
    ) -> Result<ScanValidationResponse, OrchestratorError>;

    async fn confirm_pickup(
        &self,
        cell_ids: &[CellId],
    ) -> Result<ConfirmPickupResponse, OrchestratorError>;

    async fn confirm_loaded(
        &self,
        order_id: OrderId,
        locker_cell_id: CellId,
    ) -> Result<(), OrchestratorError>;

    /// Ask the orchestrator to push this automat's mapping again.
    async fn request_sync(&self, parcel_automat_id: AutomatId) -> Result<(), OrchestratorError>;
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("status {status}: {message}")]
    Status {
        status: StatusCode,
        message: String,
        code: Option<String>,
    },
    #[error("invalid response body: {0}")]
    Decode(#[source] reqwest::Error),
}

impl Retryable for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Transport(_) | AttemptError::Decode(_) => true,
            AttemptError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

impl From<RetryError<AttemptError>> for OrchestratorError {
    fn from(err: RetryError<AttemptError>) -> Self {
        match err {
            RetryError::Cancelled { .. } => OrchestratorError::Cancelled,
            RetryError::Rejected {
                source:
                    AttemptError::Status {
                        status,
                        message,
                        code,
                    },
                ..
            } => OrchestratorError::Rejected {
                status: status.as_u16(),
                message,
                code,
            },
            other => OrchestratorError::Unavailable(other.to_string()),
        }
    }
}

/// HTTP client for the orchestrator API, retrying through [`RetryPolicy`].
#[derive(Clone)]
pub struct HttpOrchestrator {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl HttpOrchestrator {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            http,
            base_url,
            retry,
            cancel,
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<Option<T>, OrchestratorError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let http = &self.http;
        let target = url.as_str();

        let data = self
            .retry
            .call(&self.cancel, target, || async move {
                let response = http
                    .post(target)
                    .json(body)
                    .send()
                    .await
                    .map_err(AttemptError::Transport)?;

                let status = response.status();
                if !status.is_success() {
                    let (message, code) = match response.json::<ErrorResponse>().await {
                        Ok(body) => (body.message, body.error),
                        Err(_) => (status.to_string(), None),
                    };
                    return Err(AttemptError::Status {
                        status,
                        message,
                        code,
                    });
                }

                let envelope: ApiResponse<T> =
                    response.json().await.map_err(AttemptError::Decode)?;
                Ok(envelope.data)
            })
            .await?;

        debug!(url, "orchestrator call succeeded");
        Ok(data)
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn validate_scan(
        &self,
        qr_data: &str,
        parcel_automat_id: AutomatId,
    ) -> Result<ScanValidationResponse, OrchestratorError> {
        let body = ScanValidationRequest {
            qr_data: qr_data.to_string(),
            parcel_automat_id,
        };

        self.post("/automats/qr-scan", &body)
            .await?
            .ok_or_else(|| OrchestratorError::Unavailable("empty scan response".to_string()))
    }

    async fn confirm_pickup(
        &self,
        cell_ids: &[CellId],
    ) -> Result<ConfirmPickupResponse, OrchestratorError> {
        let body = ConfirmPickupRequest {
            cell_ids: cell_ids.to_vec(),
        };

        self.post("/automats/confirm-pickup", &body)
            .await?
            .ok_or_else(|| OrchestratorError::Unavailable("empty pickup response".to_string()))
    }

    async fn confirm_loaded(
        &self,
        order_id: OrderId,
        locker_cell_id: CellId,
    ) -> Result<(), OrchestratorError> {
        let body = ConfirmLoadedRequest {
            order_id,
            locker_cell_id,
        };

        self.post::<_, serde::de::IgnoredAny>("/deliveries/confirm-loaded", &body)
            .await?;
        Ok(())
    }

    async fn request_sync(&self, parcel_automat_id: AutomatId) -> Result<(), OrchestratorError> {
        let path = format!("/automats/{parcel_automat_id}/sync");
        self.post::<_, serde::de::IgnoredAny>(&path, &serde_json::json!({}))
            .await?;
        Ok(())
    }
}
