use skyport_core::{
    CellOpenRequest, CellOpenResponse, DeliveryEventRequest, DeliveryEventResponse,
    DroneStatusReport, PollTasksRequest, PollTasksResponse,
};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::{RpcError, RpcTcp, WireError, WireMessage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    rpc: RpcTcp,
    timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect error: {0}")]
    Connect(#[from] std::io::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("unexpected response type")]
    UnexpectedResponse,
    #[error("error response: {0}")]
    ErrorResponse(WireError),
}

impl Client {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_buffer(stream, 1024)
    }

    pub fn with_buffer<S>(stream: S, buffer: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            rpc: RpcTcp::new(stream, buffer),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Open a plain TCP connection to an RPC server.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Per-call timeout applied to every request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        let response = self.rpc.call(WireMessage::Ping, self.timeout).await?;

        match response.payload {
            WireMessage::Pong => Ok(()),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn cell_open(&self, request: CellOpenRequest) -> Result<CellOpenResponse, ClientError> {
        let response = self
            .rpc
            .call(WireMessage::CellOpenRequest(request), self.timeout)
            .await?;

        match response.payload {
            WireMessage::CellOpenResponse(resp) => Ok(resp),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn poll_tasks(
        &self,
        request: PollTasksRequest,
    ) -> Result<PollTasksResponse, ClientError> {
        let response = self
            .rpc
            .call(WireMessage::PollTasksRequest(request), self.timeout)
            .await?;

        match response.payload {
            WireMessage::PollTasksResponse(resp) => Ok(resp),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn delivery_event(
        &self,
        request: DeliveryEventRequest,
    ) -> Result<DeliveryEventResponse, ClientError> {
        let response = self
            .rpc
            .call(WireMessage::DeliveryEventRequest(request), self.timeout)
            .await?;

        match response.payload {
            WireMessage::DeliveryEventResponse(resp) => Ok(resp),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn drone_status(&self, report: DroneStatusReport) -> Result<(), ClientError> {
        let response = self
            .rpc
            .call(WireMessage::DroneStatusReport(report), self.timeout)
            .await?;

        match response.payload {
            WireMessage::DroneStatusAck => Ok(()),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
