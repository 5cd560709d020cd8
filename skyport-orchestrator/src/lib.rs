pub mod agent;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod rpc;
pub mod store;
pub mod tasks;
pub mod token;
pub mod worker;

pub use agent::{AgentError, HttpLockerAgent, LockerAgent};
pub use config::{Config, StorageConfig};
pub use coordinator::{Coordinator, CoordinatorError, NewAutomat, NewDrone, NewGood};
pub use store::{MemoryStore, SqliteStore, Store};
pub use tasks::TaskQueue;
pub use token::{Claims, IssuedToken, TokenAuthority, TokenError, ValidatedToken};

// Shared by every handler in `api`.
pub struct AppState<S, A> {
    pub coordinator: Coordinator<S, A>,
}

impl<S: Clone, A> Clone for AppState<S, A> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}
