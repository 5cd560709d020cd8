use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use skyport_core::CellClass;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActuatorError {
    #[error("{class} cell {number} does not exist on this controller")]
    NoSuchCell { class: CellClass, number: u32 },
    #[error("{class} cell {number} lock fault: {reason}")]
    Fault {
        class: CellClass,
        number: u32,
        reason: String,
    },
}

/// Acknowledgement returned by the lock controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorAck(pub String);

/// Drives the physical cell locks.
#[async_trait]
pub trait Actuator: Send + Sync + 'static {
    /// Release the lock of one numbered cell.
    async fn open(&self, class: CellClass, number: u32) -> Result<ActuatorAck, ActuatorError>;

    /// Number of external cells wired to the controller.
    fn cell_count(&self) -> u32;
}

/// In-process stand-in for the lock controller.
///
/// Records every open and fails on configured cell numbers.
#[derive(Clone)]
pub struct MockActuator {
    cell_count: u32,
    internal_count: u32,
    faulty: Arc<HashSet<u32>>,
    opened: Arc<Mutex<Vec<(CellClass, u32)>>>,
}

impl MockActuator {
    pub fn new(cell_count: u32, internal_count: u32) -> Self {
        Self {
            cell_count,
            internal_count,
            faulty: Arc::new(HashSet::new()),
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// External cell numbers whose lock always faults.
    pub fn with_faulty(mut self, faulty: impl IntoIterator<Item = u32>) -> Self {
        self.faulty = Arc::new(faulty.into_iter().collect());
        self
    }

    /// Every cell opened so far, in order.
    pub async fn opened(&self) -> Vec<(CellClass, u32)> {
        self.opened.lock().await.clone()
    }
}

#[async_trait]
impl Actuator for MockActuator {
    async fn open(&self, class: CellClass, number: u32) -> Result<ActuatorAck, ActuatorError> {
        let limit = match class {
            CellClass::External => self.cell_count,
            CellClass::Internal => self.internal_count,
        };
        if number == 0 || number > limit {
            return Err(ActuatorError::NoSuchCell { class, number });
        }
        if class == CellClass::External && self.faulty.contains(&number) {
            return Err(ActuatorError::Fault {
                class,
                number,
                reason: "lock did not release".to_string(),
            });
        }

        self.opened.lock().await.push((class, number));
        info!(%class, number, "mock actuator released lock");

        Ok(ActuatorAck("ok".to_string()))
    }

    fn cell_count(&self) -> u32 {
        self.cell_count
    }
}
