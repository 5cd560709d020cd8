use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use skyport_core::http::{ConfirmPickupResponse, ScanValidationResponse};
use skyport_core::{AutomatId, CellClass, CellId, OrderId};
use skyport_locker::{
    CellManager, CellRegistry, ChannelScanSource, MockActuator, Orchestrator, OrchestratorError,
    PickupService, run_scanner,
};
use skyport_rpc::CancellationToken;
use tokio::sync::mpsc;

/// Grants every well-formed scan the first mapped cell.
struct GrantAll {
    cell: CellId,
    scans: AtomicU32,
}

#[async_trait]
impl Orchestrator for GrantAll {
    async fn validate_scan(
        &self,
        _qr_data: &str,
        _parcel_automat_id: AutomatId,
    ) -> Result<ScanValidationResponse, OrchestratorError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(ScanValidationResponse {
            success: true,
            message: "ok".to_string(),
            cell_ids: vec![self.cell],
        })
    }

    async fn confirm_pickup(
        &self,
        cell_ids: &[CellId],
    ) -> Result<ConfirmPickupResponse, OrchestratorError> {
        Ok(ConfirmPickupResponse {
            success: true,
            message: "ok".to_string(),
            confirmed: cell_ids.to_vec(),
            failed: Vec::new(),
        })
    }

    async fn confirm_loaded(&self, _: OrderId, _: CellId) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn request_sync(&self, _: AutomatId) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

#[tokio::test]
async fn malformed_scans_never_reach_the_orchestrator() {
    let actuator = MockActuator::new(2, 0);
    let registry = CellRegistry::new();
    let cell = CellId::new();
    registry
        .sync(AutomatId::new(), &[cell, CellId::new()], &[])
        .await
        .unwrap();

    let orchestrator = Arc::new(GrantAll {
        cell,
        scans: AtomicU32::new(0),
    });
    let cells = CellManager::new(registry, Arc::new(actuator.clone()));
    let pickup = PickupService::new(cells, orchestrator.clone());

    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_scanner(
        pickup,
        ChannelScanSource::new(rx),
        cancel.clone(),
    ));

    tx.send("garbage".to_string()).await.unwrap();
    tx.send(r#"{"kind":"identity"}"#.to_string()).await.unwrap();
    tx.send(r#"{"kind":"identity","sub":"u","signature":"s"}"#.to_string())
        .await
        .unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(orchestrator.scans.load(Ordering::SeqCst), 1);
    assert_eq!(actuator.opened().await, vec![(CellClass::External, 1)]);
}

#[tokio::test]
async fn scanner_stops_on_cancel() {
    let registry = CellRegistry::new();
    let orchestrator = Arc::new(GrantAll {
        cell: CellId::new(),
        scans: AtomicU32::new(0),
    });
    let cells = CellManager::new(registry, Arc::new(MockActuator::new(1, 0)));
    let pickup = PickupService::new(cells, orchestrator);

    let (_tx, rx) = mpsc::channel::<String>(1);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_scanner(pickup, ChannelScanSource::new(rx), cancel.clone()));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
