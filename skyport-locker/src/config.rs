use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use skyport_core::AutomatId;
use skyport_rpc::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub locker: LockerConfig,
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Seconds to wait for in-flight requests on shutdown
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    /// Base URL of the orchestrator API, including the `/api/v1` prefix
    pub base_url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Retries after the first failed attempt
    pub retry_count: u32,
    /// Base backoff in milliseconds, multiplied by the attempt number
    pub retry_delay_ms: u64,
}

impl OrchestratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LockerConfig {
    /// Automat this agent runs on. When set, a mapping re-sync is requested on startup.
    pub automat_id: Option<AutomatId>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActuatorConfig {
    Mock {
        /// Number of external cells wired to the controller
        cell_count: u32,
        /// Number of internal doors
        internal_count: u32,
        /// External cell numbers whose lock always faults
        #[serde(default)]
        faulty_cells: Vec<u32>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScannerConfig {
    #[default]
    Disabled,
    /// Read one scanned payload per line from standard input
    Stdin,
}

fn default_grace() -> u64 {
    10
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                http_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            },
            orchestrator: OrchestratorConfig {
                base_url: "http://localhost:8080/api/v1".to_string(),
                timeout_secs: 10,
                retry_count: 3,
                retry_delay_ms: 1000,
            },
            locker: LockerConfig::default(),
            actuator: ActuatorConfig::Mock {
                cell_count: 10,
                internal_count: 3,
                faulty_cells: Vec::new(),
            },
            scanner: ScannerConfig::Disabled,
            shutdown_grace_secs: default_grace(),
        }
    }
}
