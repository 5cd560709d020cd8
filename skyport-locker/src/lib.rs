pub mod actuator;
pub mod api;
pub mod cells;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pickup;
pub mod registry;
pub mod scanner;

pub use actuator::{Actuator, ActuatorAck, ActuatorError, MockActuator};
pub use api::{AppState, router};
pub use cells::{CellCount, CellManager, CellOutcome};
pub use config::{ActuatorConfig, Config, ScannerConfig};
pub use error::LockerError;
pub use orchestrator::{HttpOrchestrator, Orchestrator, OrchestratorError};
pub use pickup::PickupService;
pub use registry::{CellMapping, CellRegistry, RegistryError, SyncSummary};
pub use scanner::{ChannelScanSource, ScanSource, StdinScanSource, run_scanner};
