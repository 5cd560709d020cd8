use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{RpcTcp, WireError, WireErrorCode, WireMessage};
use skyport_core::{CellOpenRequest, DeliveryEventRequest, DroneStatusReport, PollTasksRequest};

type BoxFuture = Pin<Box<dyn Future<Output = WireMessage> + Send>>;

pub type HandlerFn<T> = Box<dyn Fn(T) -> BoxFuture + Send + Sync>;

/// Accepts RPC connections and dispatches requests to registered handlers.
///
/// Each request runs in its own task so a slow handler does not hold up
/// other requests multiplexed on the same connection.
pub struct Server {
    listener: TcpListener,
    buffer_size: usize,
    handlers: ServerHandlers,
}

#[derive(Default)]
struct ServerHandlers {
    on_cell_open: Option<HandlerFn<CellOpenRequest>>,
    on_poll_tasks: Option<HandlerFn<PollTasksRequest>>,
    on_delivery_event: Option<HandlerFn<DeliveryEventRequest>>,
    on_drone_status: Option<HandlerFn<DroneStatusReport>>,
}

fn boxed<T, F, Fut>(handler: F) -> HandlerFn<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WireMessage> + Send + 'static,
{
    Box::new(move |request| Box::pin(handler(request)))
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            buffer_size: 1024,
            handlers: ServerHandlers::default(),
        }
    }

    pub fn with_buffer(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn on_cell_open<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CellOpenRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WireMessage> + Send + 'static,
    {
        self.handlers.on_cell_open = Some(boxed(handler));
        self
    }

    pub fn on_poll_tasks<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PollTasksRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WireMessage> + Send + 'static,
    {
        self.handlers.on_poll_tasks = Some(boxed(handler));
        self
    }

    pub fn on_delivery_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(DeliveryEventRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WireMessage> + Send + 'static,
    {
        self.handlers.on_delivery_event = Some(boxed(handler));
        self
    }

    pub fn on_drone_status<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(DroneStatusReport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WireMessage> + Send + 'static,
    {
        self.handlers.on_drone_status = Some(boxed(handler));
        self
    }

    fn dispatch(
        handlers: &ServerHandlers,
        payload: WireMessage,
    ) -> Option<BoxFuture> {
        let missing = |kind: &str| -> BoxFuture {
            tracing::warn!(kind, "request received but no handler registered");
            let err = WireError::new(WireErrorCode::Internal, format!("no handler for {kind}"));
            Box::pin(async move { WireMessage::Error(err) })
        };

        let fut: BoxFuture = match payload {
            WireMessage::Ping => Box::pin(async { WireMessage::Pong }),
            WireMessage::CellOpenRequest(request) => match &handlers.on_cell_open {
                Some(handler) => handler(request),
                None => missing("cell_open"),
            },
            WireMessage::PollTasksRequest(request) => match &handlers.on_poll_tasks {
                Some(handler) => handler(request),
                None => missing("poll_tasks"),
            },
            WireMessage::DeliveryEventRequest(request) => match &handlers.on_delivery_event {
                Some(handler) => handler(request),
                None => missing("delivery_event"),
            },
            WireMessage::DroneStatusReport(report) => match &handlers.on_drone_status {
                Some(handler) => handler(report),
                None => missing("drone_status"),
            },
            WireMessage::Error(err) => {
                tracing::warn!(error = %err, "received error frame");
                return None;
            }
            other => {
                tracing::debug!(message = ?other, "ignoring response frame on server");
                return None;
            }
        };

        Some(fut)
    }

    async fn handle_connection(
        handlers: Arc<ServerHandlers>,
        stream: TcpStream,
        buffer_size: usize,
        cancel: CancellationToken,
    ) {
        let mut rpc = RpcTcp::new(stream, buffer_size);

        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                env = rpc.recv() => match env {
                    Some(env) => env,
                    None => {
                        tracing::debug!("rpc connection closed");
                        break;
                    }
                },
            };

            let msg_id = envelope.msg_id;
            let Some(fut) = Self::dispatch(&handlers, envelope.payload) else {
                continue;
            };

            let replier = rpc.replier();
            tokio::spawn(async move {
                let response = fut.await;
                if let Err(e) = replier.reply(msg_id, response).await {
                    tracing::warn!(error = %e, "failed to send rpc reply");
                }
            });
        }
    }

    /// Accept connections until `cancel` fires or the listener fails.
    pub async fn serve(self, cancel: CancellationToken) {
        let handlers = Arc::new(self.handlers);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("rpc server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "rpc client connected");
                        let handlers = handlers.clone();
                        let buffer_size = self.buffer_size;
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            Self::handle_connection(handlers, stream, buffer_size, cancel).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "error accepting rpc connection");
                        break;
                    }
                },
            }
        }
    }
}
