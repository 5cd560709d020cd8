pub mod api;
pub mod config;
pub mod fleet;
pub mod handler;
pub mod link;
pub mod telemetry;
pub mod worker;

pub use api::router;
pub use config::Config;
pub use fleet::{DroneView, Fleet, FleetError, PendingTask};
pub use handler::DeliveryHandler;
pub use link::{LinkError, OrchestratorLink};
pub use telemetry::{ConnectionError, TelemetryServer};
pub use worker::{TaskDispatcher, run_dispatcher};
