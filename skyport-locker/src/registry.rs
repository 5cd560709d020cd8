use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use skyport_core::{AutomatId, CellClass, CellId};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("cell mapping not initialized")]
    NotInitialized,
    #[error("{class} cell {number} not found")]
    NumberNotFound { class: CellClass, number: u32 },
    #[error("cell {0} not found")]
    IdNotFound(CellId),
    #[error("invalid cell number {0}")]
    InvalidNumber(u32),
    #[error("cell {0} listed more than once")]
    DuplicateCell(CellId),
}

/// Point-in-time copy of the number ↔ identifier mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CellMapping {
    pub parcel_automat_id: Option<AutomatId>,
    pub external_cells: BTreeMap<u32, CellId>,
    pub internal_cells: BTreeMap<u32, CellId>,
    pub last_sync_time: Option<jiff::Timestamp>,
    pub initialized: bool,
}

impl CellMapping {
    fn cells(&self, class: CellClass) -> &BTreeMap<u32, CellId> {
        match class {
            CellClass::External => &self.external_cells,
            CellClass::Internal => &self.internal_cells,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub parcel_automat_id: AutomatId,
    pub external_count: usize,
    pub internal_count: usize,
}

#[derive(Default)]
struct Inner {
    mapping: CellMapping,
    by_id: HashMap<CellId, (u32, CellClass)>,
}

/// Live correspondence between physical cell numbers and orchestrator-issued
/// identifiers.
///
/// A sync builds the replacement tables before taking the write lock, so
/// readers observe either the previous mapping or the new one in full.
#[derive(Clone, Default)]
pub struct CellRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl CellRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole mapping. Cells are numbered `1..=len` in list order.
    pub async fn sync(
        &self,
        parcel_automat_id: AutomatId,
        external: &[CellId],
        internal: &[CellId],
    ) -> Result<SyncSummary, RegistryError> {
        let mut by_id = HashMap::with_capacity(external.len() + internal.len());
        let mut tables = [BTreeMap::new(), BTreeMap::new()];

        for (table, (class, ids)) in tables.iter_mut().zip([
            (CellClass::External, external),
            (CellClass::Internal, internal),
        ]) {
            for (number, id) in (1u32..).zip(ids.iter().copied()) {
                if by_id.insert(id, (number, class)).is_some() {
                    return Err(RegistryError::DuplicateCell(id));
                }
                table.insert(number, id);
            }
        }

        let [external_cells, internal_cells] = tables;
        let mapping = CellMapping {
            parcel_automat_id: Some(parcel_automat_id),
            external_cells,
            internal_cells,
            last_sync_time: Some(jiff::Timestamp::now()),
            initialized: true,
        };

        let summary = SyncSummary {
            parcel_automat_id,
            external_count: external.len(),
            internal_count: internal.len(),
        };

        let mut inner = self.inner.write().await;
        *inner = Inner { mapping, by_id };

        Ok(summary)
    }

    pub async fn identifier(&self, number: u32, class: CellClass) -> Result<CellId, RegistryError> {
        if number == 0 {
            return Err(RegistryError::InvalidNumber(number));
        }

        let inner = self.inner.read().await;
        if !inner.mapping.initialized {
            return Err(RegistryError::NotInitialized);
        }

        inner
            .mapping
            .cells(class)
            .get(&number)
            .copied()
            .ok_or(RegistryError::NumberNotFound { class, number })
    }

    /// Reverse lookup across both cell classes.
    pub async fn number(&self, id: CellId) -> Result<(u32, CellClass), RegistryError> {
        let inner = self.inner.read().await;
        if !inner.mapping.initialized {
            return Err(RegistryError::NotInitialized);
        }

        inner
            .by_id
            .get(&id)
            .copied()
            .ok_or(RegistryError::IdNotFound(id))
    }

    pub async fn snapshot(&self) -> CellMapping {
        self.inner.read().await.mapping.clone()
    }

    pub async fn clear(&self) {
        *self.inner.write().await = Inner::default();
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.mapping.initialized
    }

    pub async fn automat_id(&self) -> Option<AutomatId> {
        self.inner.read().await.mapping.parcel_automat_id
    }

    /// Number of mapped external and internal cells.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (
            inner.mapping.external_cells.len(),
            inner.mapping.internal_cells.len(),
        )
    }
}
