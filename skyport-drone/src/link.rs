//! Connection to the orchestrator RPC server.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use skyport_core::{
    CellOpenRequest, CellOpenResponse, DeliveryEventRequest, DeliveryEventResponse,
    DroneStatusReport, PollTasksRequest, PollTasksResponse,
};
use skyport_rpc::{Client, ClientError, RetryError, RetryPolicy};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type LinkError = RetryError<ClientError>;

/// Lazily connected, self-healing RPC client. Every call goes through the
/// retry policy; a broken connection is dropped and re-established on the
/// next attempt.
pub struct OrchestratorLink {
    addr: SocketAddr,
    timeout: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
    client: Mutex<Option<Arc<Client>>>,
}

impl OrchestratorLink {
    pub fn new(
        addr: SocketAddr,
        timeout: Duration,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            timeout,
            retry,
            cancel,
            client: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn client(&self) -> Result<Arc<Client>, ClientError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            warn!(addr = %self.addr, "Orchestrator connection closed, reconnecting");
        }

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;

        let client = Arc::new(Client::new(stream).with_timeout(self.timeout));
        info!(addr = %self.addr, "Connected to orchestrator");
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn reset(&self, broken: &Arc<Client>) {
        let mut guard = self.client.lock().await;
        if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, broken)) {
            *guard = None;
        }
    }

    async fn call<T, F, Fut>(&self, target: &str, op: F) -> Result<T, LinkError>
    where
        F: Fn(Arc<Client>) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let link = self;
        let op = &op;
        self.retry
            .call(&self.cancel, target, || async move {
                let client = link.client().await?;
                let result = op(client.clone()).await;
                if let Err(ClientError::Rpc(_)) = &result {
                    link.reset(&client).await;
                }
                result
            })
            .await
    }

    pub async fn cell_open(&self, request: CellOpenRequest) -> Result<CellOpenResponse, LinkError> {
        self.call("orchestrator cell_open", move |client| async move {
            client.cell_open(request).await
        })
        .await
    }

    pub async fn poll_tasks(&self, max: u32) -> Result<PollTasksResponse, LinkError> {
        self.call("orchestrator poll_tasks", move |client| async move {
            client.poll_tasks(PollTasksRequest { max }).await
        })
        .await
    }

    pub async fn delivery_event(
        &self,
        request: DeliveryEventRequest,
    ) -> Result<DeliveryEventResponse, LinkError> {
        self.call("orchestrator delivery_event", |client| {
            let request = request.clone();
            async move { client.delivery_event(request).await }
        })
        .await
    }

    pub async fn drone_status(&self, report: DroneStatusReport) -> Result<(), LinkError> {
        self.call("orchestrator drone_status", move |client| async move {
            client.drone_status(report).await
        })
        .await
    }
}
