use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use skyport_core::CellId;
use skyport_core::http::{
    ErrorResponse, OpenCellResponse, PrepareCellRequest, SyncCellsRequest, SyncCellsResponse,
};
use skyport_rpc::{CancellationToken, RetryError, RetryPolicy, Retryable};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent refused the request; repeating it cannot help.
    #[error("locker agent rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("locker agent unavailable: {0}")]
    Unavailable(String),
    #[error("request cancelled")]
    Cancelled,
}

/// Calls the orchestrator makes to locker agents.
#[async_trait]
pub trait LockerAgent: Send + Sync + 'static {
    /// Push a full cell mapping.
    async fn sync_cells(
        &self,
        agent_url: &str,
        request: &SyncCellsRequest,
    ) -> Result<SyncCellsResponse, AgentError>;

    /// Open a cell by identifier for a drop-off.
    async fn prepare_cell(
        &self,
        agent_url: &str,
        cell_id: CellId,
    ) -> Result<OpenCellResponse, AgentError>;
}

#[derive(Debug, thiserror::Error)]
enum CallError {
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

impl Retryable for CallError {
    fn is_retryable(&self) -> bool {
        match self {
            CallError::Status { status, .. } => !status.is_client_error(),
            CallError::Transport(_) | CallError::Decode(_) => true,
        }
    }
}

impl From<RetryError<CallError>> for AgentError {
    fn from(err: RetryError<CallError>) -> Self {
        if err.is_cancelled() {
            return AgentError::Cancelled;
        }

        match err {
            RetryError::Rejected {
                source:
                    CallError::Status {
                        status,
                        message,
                        code,
                    },
                ..
            } => AgentError::Rejected {
                status: status.as_u16(),
                message,
                code,
            },
            other => AgentError::Unavailable(other.to_string()),
        }
    }
}

/// Locker agent client over HTTP.
#[derive(Clone)]
pub struct HttpLockerAgent {
    http: reqwest::Client,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl HttpLockerAgent {
    pub fn new(
        timeout: Duration,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            retry,
            cancel,
        })
    }

    async fn post<B, T>(&self, agent_url: &str, path: &str, body: &B) -> Result<T, AgentError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", agent_url.trim_end_matches('/'), path);
        let http = &self.http;
        let target = url.as_str();

        let response = self
            .retry
            .call(&self.cancel, target, || async move {
                let response = http
                    .post(target)
                    .json(body)
                    .send()
                    .await
                    .map_err(CallError::Transport)?;

                let status = response.status();
                if status.is_success() {
                    return response.json::<T>().await.map_err(CallError::Decode);
                }

                let (message, code) = match response.json::<ErrorResponse>().await {
                    Ok(body) => (body.message, body.error),
                    Err(_) => (status.to_string(), None),
                };
                Err(CallError::Status {
                    status,
                    message,
                    code,
                })
            })
            .await?;

        debug!(url, "locker agent call succeeded");
        Ok(response)
    }
}

#[async_trait]
impl LockerAgent for HttpLockerAgent {
    async fn sync_cells(
        &self,
        agent_url: &str,
        request: &SyncCellsRequest,
    ) -> Result<SyncCellsResponse, AgentError> {
        self.post(agent_url, "/api/cells/sync", request).await
    }

    async fn prepare_cell(
        &self,
        agent_url: &str,
        cell_id: CellId,
    ) -> Result<OpenCellResponse, AgentError> {
        let body = PrepareCellRequest {
            cell_id: cell_id.to_string(),
        };
        self.post(agent_url, "/api/cells/prepare", &body).await
    }
}
