use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader, BufWriter},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{Envelope, FrameError, MessageId, WireMessage, read_frame, write_frame};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("send error: {0}")]
    SendError(#[source] Box<mpsc::error::SendError<Envelope>>),
    #[error("response channel closed: {0}")]
    ChannelClosed(#[from] oneshot::error::RecvError),
    #[error("timeout: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

impl From<mpsc::error::SendError<Envelope>> for RpcError {
    fn from(err: mpsc::error::SendError<Envelope>) -> Self {
        RpcError::SendError(Box::new(err))
    }
}

type Pending = Arc<DashMap<MessageId, oneshot::Sender<Envelope>>>;

/// Bidirectional request/reply transport over any byte stream.
///
/// A writer task drains outgoing envelopes and a reader task routes replies
/// to their waiting callers; everything else is surfaced through [`RpcTcp::recv`].
/// When either task stops the connection is considered closed and all
/// waiting callers are released.
pub struct RpcTcp {
    tx: mpsc::Sender<Envelope>,
    rx: mpsc::Receiver<Envelope>,
    pending: Pending,
    closed: CancellationToken,
}

impl RpcTcp {
    pub fn new<S>(stream: S, buffer: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let (tx_out, mut rx_out) = mpsc::channel::<Envelope>(buffer);
        let (tx_in, rx_in) = mpsc::channel::<Envelope>(buffer);

        let pending: Pending = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        let closed_writer = closed.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = closed_writer.cancelled() => break,
                    msg = rx_out.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };

                if let Err(e) = write_frame(&mut writer, &msg).await {
                    tracing::error!(error = %e, "rpc writer error");
                    break;
                }
                tracing::trace!(msg_id = ?msg.msg_id, "wrote frame");
            }
            closed_writer.cancel();
        });

        let pending_reader = pending.clone();
        let closed_reader = closed.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = closed_reader.cancelled() => break,
                    frame = read_frame(&mut reader) => match frame {
                        Ok(m) => m,
                        Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            tracing::debug!("rpc peer closed connection");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "rpc reader error");
                            break;
                        }
                    },
                };

                tracing::trace!(msg_id = ?msg.msg_id, reply_to = ?msg.reply_to, "read frame");

                if let Some(reply_to) = msg.reply_to {
                    if let Some((_, tx)) = pending_reader.remove(&reply_to) {
                        let _ = tx.send(msg);
                        continue;
                    }
                    tracing::warn!(reply_to = ?reply_to, "no waiter found for reply");
                    continue;
                }

                if tx_in.send(msg).await.is_err() {
                    break;
                }
            }
            closed_reader.cancel();
            // Dropping the senders wakes every caller still waiting for a reply.
            pending_reader.clear();
        });

        Self {
            tx: tx_out,
            rx: rx_in,
            pending,
            closed,
        }
    }

    /// Whether the underlying connection has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn send(&self, payload: WireMessage) -> Result<MessageId, RpcError> {
        let msg_id = MessageId::new();
        let env = Envelope {
            msg_id,
            reply_to: None,
            payload,
        };

        self.tx.send(env).await?;

        Ok(msg_id)
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            env = self.rx.recv() => env,
        }
    }

    pub async fn call(&self, payload: WireMessage, timeout: Duration) -> Result<Envelope, RpcError> {
        let msg_id = MessageId::new();
        let (tx_wait, rx_wait) = oneshot::channel();

        self.pending.insert(msg_id, tx_wait);

        let env = Envelope {
            msg_id,
            reply_to: None,
            payload,
        };

        if let Err(e) = self.tx.send(env).await {
            self.pending.remove(&msg_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx_wait).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(closed)) => Err(RpcError::ChannelClosed(closed)),
            Err(elapsed) => {
                self.pending.remove(&msg_id);
                Err(RpcError::Timeout(elapsed))
            }
        }
    }

    pub async fn reply(
        &self,
        request_msg_id: MessageId,
        payload: WireMessage,
    ) -> Result<MessageId, RpcError> {
        self.replier().reply(request_msg_id, payload).await
    }

    /// A cloneable handle that can answer requests from other tasks.
    pub fn replier(&self) -> Replier {
        Replier {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Replier {
    tx: mpsc::Sender<Envelope>,
}

impl Replier {
    pub async fn reply(
        &self,
        request_msg_id: MessageId,
        payload: WireMessage,
    ) -> Result<MessageId, RpcError> {
        let msg_id = MessageId::new();
        let env = Envelope {
            msg_id,
            reply_to: Some(request_msg_id),
            payload,
        };

        self.tx.send(env).await?;

        Ok(msg_id)
    }
}

impl Drop for RpcTcp {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
