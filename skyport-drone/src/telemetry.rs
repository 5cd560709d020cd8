use std::net::SocketAddr;
use std::time::Duration;

use skyport_core::DroneId;
use skyport_core::telemetry::{DroneCommand, DroneMessage, TelemetryError};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, field, info, instrument, warn};

use crate::handler::DeliveryHandler;

/// Time a drone has to identify itself after connecting.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Handshake failed: expected hello, got {0}")]
    HandshakeMismatch(&'static str),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection closed before hello")]
    ClosedBeforeHello,

    #[error("Bad hello frame: {0}")]
    BadHello(#[from] TelemetryError),

    #[error("Command encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts drone connections speaking newline-delimited JSON.
pub struct TelemetryServer {
    listener: TcpListener,
    handler: DeliveryHandler,
}

impl TelemetryServer {
    pub async fn bind(addr: SocketAddr, handler: DeliveryHandler) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[instrument(name = "telemetry_server", skip_all)]
    pub async fn serve(self, cancel: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Telemetry server started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Closing telemetry server");
                    break;
                }
                client = self.listener.accept() => {
                    match client {
                        Ok((stream, addr)) => {
                            info!(%addr, "Drone connected");
                            let handler = self.handler.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_drone(stream, addr, handler, cancel).await {
                                    error!(%addr, error = %e, "Drone connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            if is_transient_error(&e) {
                                sleep(Duration::from_millis(100)).await;
                            } else {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn is_transient_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionRefused | ConnectionAborted | ConnectionReset | OutOfMemory | Other
    )
}

async fn write_command(
    writer: &mut OwnedWriteHalf,
    command: &DroneCommand,
) -> Result<(), ConnectionError> {
    let mut line = command.encode()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

#[instrument(name = "drone_connection", skip(stream, handler, cancel), fields(drone_id = field::Empty))]
async fn handle_drone(
    stream: TcpStream,
    addr: SocketAddr,
    handler: DeliveryHandler,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let first = tokio::time::timeout(HELLO_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)??
        .ok_or(ConnectionError::ClosedBeforeHello)?;

    let drone_id: DroneId = match DroneMessage::decode(&first)? {
        DroneMessage::Hello { drone_id } => drone_id,
        other => return Err(ConnectionError::HandshakeMismatch(other.kind())),
    };
    Span::current().record("drone_id", field::display(&drone_id));

    let fleet = handler.fleet().clone();
    let mut session = fleet.connect(drone_id);
    info!("Handshake complete");

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown signal received");
                break Ok(());
            }
            command = session.commands.recv() => {
                // The fleet only drops the sender when a newer connection took over.
                let Some(command) = command else {
                    info!("Superseded by a newer connection");
                    break Ok(());
                };
                debug!(?command, "sending command");
                if let Err(e) = write_command(&mut writer, &command).await {
                    break Err(e);
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Drone closed connection");
                        break Ok(());
                    }
                    Err(e) => break Err(ConnectionError::Io(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }

                match DroneMessage::decode(&line) {
                    Ok(message) => handler.handle(drone_id, message).await,
                    Err(e) => warn!(error = %e, "Dropping telemetry frame"),
                }
            }
        }
    };

    fleet.disconnect(drone_id, session.id);
    result
}
