use std::sync::Arc;

use skyport_core::http::{ConfirmPickupResponse, ScanResponse};
use skyport_core::{CellId, OrderId};
use tracing::{info, warn};

use crate::actuator::Actuator;
use crate::cells::CellManager;
use crate::error::LockerError;
use crate::orchestrator::Orchestrator;

/// Turns a scanned token into opened cells and a confirmed pickup.
pub struct PickupService<A, O> {
    cells: CellManager<A>,
    orchestrator: Arc<O>,
}

impl<A, O> Clone for PickupService<A, O> {
    fn clone(&self) -> Self {
        Self {
            cells: self.cells.clone(),
            orchestrator: self.orchestrator.clone(),
        }
    }
}

impl<A: Actuator, O: Orchestrator> PickupService<A, O> {
    pub fn new(cells: CellManager<A>, orchestrator: Arc<O>) -> Self {
        Self {
            cells,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &O {
        &self.orchestrator
    }

    /// Validate `qr_data` with the orchestrator, open the granted cells and
    /// confirm the ones that actually opened.
    pub async fn process_scan(&self, qr_data: &str) -> Result<ScanResponse, LockerError> {
        let automat = self
            .cells
            .registry()
            .automat_id()
            .await
            .ok_or(LockerError::NotInitialized)?;

        let validation = self.orchestrator.validate_scan(qr_data, automat).await?;
        if !validation.success || validation.cell_ids.is_empty() {
            return Err(LockerError::Validation(validation.message));
        }

        let outcomes = self.cells.open_by_ids(&validation.cell_ids).await?;
        let opened: Vec<CellId> = outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.cell_id)
            .collect();

        if opened.is_empty() {
            warn!(
                parcel_automat_id = %automat,
                granted = validation.cell_ids.len(),
                "no granted cell could be opened"
            );
            return Ok(ScanResponse {
                success: false,
                message: "no cells could be opened".to_string(),
                cells_opened: Vec::new(),
                cell_count: 0,
            });
        }

        match self.orchestrator.confirm_pickup(&opened).await {
            Ok(confirmation) if !confirmation.failed.is_empty() => {
                warn!(failed = ?confirmation.failed, "orchestrator refused some pickups");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "pickup confirmation failed, cells stay occupied"),
        }

        info!(
            parcel_automat_id = %automat,
            opened = opened.len(),
            granted = validation.cell_ids.len(),
            "pickup scan processed"
        );

        Ok(ScanResponse {
            success: true,
            message: format!(
                "opened {} of {} cell(s)",
                opened.len(),
                validation.cell_ids.len()
            ),
            cell_count: opened.len(),
            cells_opened: opened,
        })
    }

    /// Relay a pickup confirmation for cells opened by other means.
    pub async fn confirm_pickup(
        &self,
        cell_ids: &[CellId],
    ) -> Result<ConfirmPickupResponse, LockerError> {
        if cell_ids.is_empty() {
            return Err(LockerError::InvalidInput("cell_ids is empty".to_string()));
        }
        Ok(self.orchestrator.confirm_pickup(cell_ids).await?)
    }

    /// Relay a manual load through an internal door.
    pub async fn confirm_loaded(&self, order_id: OrderId, cell_id: CellId) -> Result<(), LockerError> {
        // The cell must belong to this automat's mapping.
        self.cells.registry().number(cell_id).await?;
        self.orchestrator.confirm_loaded(order_id, cell_id).await?;
        info!(%order_id, %cell_id, "parcel load confirmed");
        Ok(())
    }
}
