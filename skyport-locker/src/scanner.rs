use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actuator::Actuator;
use crate::orchestrator::Orchestrator;
use crate::pickup::PickupService;

/// Source of raw scanned payloads.
#[async_trait]
pub trait ScanSource: Send + 'static {
    /// Next scan, or `None` once the source is exhausted.
    async fn next_scan(&mut self) -> Option<String>;
}

/// Scans pushed through a channel, e.g. by a camera decoder task.
pub struct ChannelScanSource {
    rx: mpsc::Receiver<String>,
}

impl ChannelScanSource {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl ScanSource for ChannelScanSource {
    async fn next_scan(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// One scan per line of standard input.
pub struct StdinScanSource {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinScanSource {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinScanSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanSource for StdinScanSource {
    async fn next_scan(&mut self) -> Option<String> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some(line),
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "failed to read scan from stdin");
                    return None;
                }
            }
        }
    }
}

/// A scan is forwarded only if it is a JSON object carrying `kind`, `sub` and `signature`.
pub fn is_well_formed(raw: &str) -> bool {
    match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw.trim()) {
        Ok(doc) => ["kind", "sub", "signature"]
            .iter()
            .all(|field| doc.contains_key(*field)),
        Err(_) => false,
    }
}

/// Feed scans from `source` into the pickup flow until cancelled or exhausted.
pub async fn run_scanner<A, O, S>(
    pickup: PickupService<A, O>,
    mut source: S,
    cancel: CancellationToken,
) where
    A: Actuator,
    O: Orchestrator,
    S: ScanSource,
{
    info!("scanner loop started");

    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            scan = source.next_scan() => match scan {
                Some(raw) => raw,
                None => {
                    debug!("scan source exhausted");
                    break;
                }
            },
        };

        if !is_well_formed(&raw) {
            warn!(len = raw.len(), "ignoring malformed scan");
            continue;
        }

        match pickup.process_scan(&raw).await {
            Ok(response) => info!(
                success = response.success,
                opened = response.cell_count,
                message = %response.message,
                "scan handled"
            ),
            Err(e) => warn!(error = %e, "scan failed"),
        }
    }

    info!("scanner loop stopped");
}
