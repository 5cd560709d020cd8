use std::sync::Arc;

use serde::Serialize;
use skyport_core::http::{CellAction, OpenCellResponse, SyncCellsRequest};
use skyport_core::{AutomatId, CellClass, CellId};
use tracing::{info, warn};

use crate::actuator::Actuator;
use crate::error::LockerError;
use crate::registry::{CellMapping, CellRegistry, SyncSummary};

/// Result of opening one cell out of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct CellOutcome {
    pub cell_id: CellId,
    pub cell_number: Option<u32>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellCount {
    /// Cells physically wired to the lock controller.
    pub hardware: u32,
    pub external: usize,
    pub internal: usize,
}

/// Couples the cell registry with the lock actuator.
pub struct CellManager<A> {
    registry: CellRegistry,
    actuator: Arc<A>,
}

impl<A> Clone for CellManager<A> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            actuator: self.actuator.clone(),
        }
    }
}

fn parse_ids(field: &str, raw: &[String]) -> Result<Vec<CellId>, LockerError> {
    raw.iter()
        .map(|s| {
            s.parse::<CellId>()
                .map_err(|_| LockerError::InvalidInput(format!("malformed {field} entry '{s}'")))
        })
        .collect()
}

impl<A: Actuator> CellManager<A> {
    pub fn new(registry: CellRegistry, actuator: Arc<A>) -> Self {
        Self { registry, actuator }
    }

    pub fn registry(&self) -> &CellRegistry {
        &self.registry
    }

    /// Replace the mapping from a sync body pushed by the orchestrator.
    pub async fn sync(&self, request: &SyncCellsRequest) -> Result<SyncSummary, LockerError> {
        let automat: AutomatId = request.parcel_automat_id.parse().map_err(|_| {
            LockerError::InvalidInput(format!(
                "malformed parcel_automat_id '{}'",
                request.parcel_automat_id
            ))
        })?;
        let external = parse_ids("external_cell_ids", &request.external_cell_ids)?;
        let internal = parse_ids("internal_cell_ids", &request.internal_cell_ids)?;

        let hardware = self.actuator.cell_count() as usize;
        if external.len() > hardware {
            warn!(
                mapped = external.len(),
                hardware, "sync maps more external cells than the controller drives"
            );
        }

        let summary = self.registry.sync(automat, &external, &internal).await?;
        info!(
            parcel_automat_id = %summary.parcel_automat_id,
            external = summary.external_count,
            internal = summary.internal_count,
            "cell mapping synchronized"
        );

        Ok(summary)
    }

    async fn actuate(
        &self,
        number: u32,
        class: CellClass,
        cell_id: CellId,
    ) -> Result<OpenCellResponse, LockerError> {
        let ack = self.actuator.open(class, number).await?;
        let action = match class {
            CellClass::External => CellAction::Opened,
            CellClass::Internal => CellAction::InternalOpened,
        };

        Ok(OpenCellResponse {
            success: true,
            cell_number: number,
            cell_id,
            class,
            action,
            actuator_status: ack.0,
        })
    }

    /// Open an external cell by its physical number.
    pub async fn open_cell(
        &self,
        number: u32,
        order_number: Option<&str>,
    ) -> Result<OpenCellResponse, LockerError> {
        let cell_id = self.registry.identifier(number, CellClass::External).await?;
        info!(number, %cell_id, order_number, "opening cell");
        self.actuate(number, CellClass::External, cell_id).await
    }

    /// Open an internal door by its physical number.
    pub async fn open_internal(
        &self,
        number: u32,
        order_number: Option<&str>,
    ) -> Result<OpenCellResponse, LockerError> {
        let cell_id = self.registry.identifier(number, CellClass::Internal).await?;
        info!(number, %cell_id, order_number, "opening internal door");
        self.actuate(number, CellClass::Internal, cell_id).await
    }

    /// Open a cell by identifier, routing to the external or internal bank.
    pub async fn prepare(&self, cell_id: &str) -> Result<OpenCellResponse, LockerError> {
        let cell_id: CellId = cell_id
            .parse()
            .map_err(|_| LockerError::InvalidInput(format!("malformed cell_id '{cell_id}'")))?;
        let (number, class) = self.registry.number(cell_id).await?;

        info!(%cell_id, number, %class, "preparing cell for drop-off");
        self.actuate(number, class, cell_id).await
    }

    /// Open every listed cell. A failure on one cell does not stop the rest.
    pub async fn open_by_ids(&self, cell_ids: &[CellId]) -> Result<Vec<CellOutcome>, LockerError> {
        if !self.registry.is_initialized().await {
            return Err(LockerError::NotInitialized);
        }

        let mut outcomes = Vec::with_capacity(cell_ids.len());
        for &cell_id in cell_ids {
            let outcome = match self.registry.number(cell_id).await {
                Ok((number, class)) => match self.actuate(number, class, cell_id).await {
                    Ok(_) => CellOutcome {
                        cell_id,
                        cell_number: Some(number),
                        success: true,
                        error: None,
                    },
                    Err(e) => {
                        warn!(%cell_id, number, error = %e, "failed to open cell");
                        CellOutcome {
                            cell_id,
                            cell_number: Some(number),
                            success: false,
                            error: Some(e.to_string()),
                        }
                    }
                },
                Err(e) => {
                    warn!(%cell_id, error = %e, "cell not in mapping");
                    CellOutcome {
                        cell_id,
                        cell_number: None,
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    pub async fn count(&self) -> CellCount {
        let (external, internal) = self.registry.counts().await;
        CellCount {
            hardware: self.actuator.cell_count(),
            external,
            internal,
        }
    }

    pub async fn mapping(&self) -> CellMapping {
        self.registry.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::MockActuator;

    fn request(automat: AutomatId, external: &[CellId], internal: &[CellId]) -> SyncCellsRequest {
        SyncCellsRequest {
            parcel_automat_id: automat.to_string(),
            external_cell_ids: external.iter().map(ToString::to_string).collect(),
            internal_cell_ids: internal.iter().map(ToString::to_string).collect(),
        }
    }

    fn manager(actuator: MockActuator) -> CellManager<MockActuator> {
        CellManager::new(CellRegistry::new(), Arc::new(actuator))
    }

    #[tokio::test]
    async fn malformed_identifier_rejects_the_whole_sync() {
        let cells = manager(MockActuator::new(4, 0));
        let mut body = request(AutomatId::new(), &[CellId::new()], &[]);
        body.external_cell_ids.push("cell-two".to_string());

        let err = cells.sync(&body).await.unwrap_err();
        assert!(matches!(err, LockerError::InvalidInput(_)));
        assert!(!cells.registry().is_initialized().await);
    }

    #[tokio::test]
    async fn prepare_routes_by_class() {
        let actuator = MockActuator::new(4, 2);
        let cells = manager(actuator.clone());
        let external = [CellId::new(), CellId::new()];
        let internal = [CellId::new(), CellId::new()];
        cells
            .sync(&request(AutomatId::new(), &external, &internal))
            .await
            .unwrap();

        let ext = cells.prepare(&external[1].to_string()).await.unwrap();
        assert_eq!(ext.cell_number, 2);
        assert_eq!(ext.action, CellAction::Opened);

        let int = cells.prepare(&internal[0].to_string()).await.unwrap();
        assert_eq!(int.cell_number, 1);
        assert_eq!(int.action, CellAction::InternalOpened);

        assert_eq!(
            actuator.opened().await,
            vec![(CellClass::External, 2), (CellClass::Internal, 1)]
        );
    }

    #[tokio::test]
    async fn batch_open_records_per_cell_failures() {
        let actuator = MockActuator::new(3, 0).with_faulty([2]);
        let cells = manager(actuator.clone());
        let external = [CellId::new(), CellId::new(), CellId::new()];
        cells
            .sync(&request(AutomatId::new(), &external, &[]))
            .await
            .unwrap();

        let stranger = CellId::new();
        let outcomes = cells
            .open_by_ids(&[external[0], external[1], stranger, external[2]])
            .await
            .unwrap();

        let ok: Vec<bool> = outcomes.iter().map(|o| o.success).collect();
        assert_eq!(ok, vec![true, false, false, true]);
        assert_eq!(outcomes[2].cell_number, None);
        assert_eq!(
            actuator.opened().await,
            vec![(CellClass::External, 1), (CellClass::External, 3)]
        );
    }

    #[tokio::test]
    async fn operations_fail_fast_before_sync() {
        let cells = manager(MockActuator::new(3, 0));

        assert!(matches!(
            cells.open_cell(1, None).await,
            Err(LockerError::NotInitialized)
        ));
        assert!(matches!(
            cells.prepare(&CellId::new().to_string()).await,
            Err(LockerError::NotInitialized)
        ));
        assert!(matches!(
            cells.open_by_ids(&[CellId::new()]).await,
            Err(LockerError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn count_reports_hardware_and_mapping() {
        let cells = manager(MockActuator::new(8, 3));
        cells
            .sync(&request(
                AutomatId::new(),
                &[CellId::new(), CellId::new()],
                &[CellId::new()],
            ))
            .await
            .unwrap();

        assert_eq!(
            cells.count().await,
            CellCount {
                hardware: 8,
                external: 2,
                internal: 1
            }
        );
    }
}
