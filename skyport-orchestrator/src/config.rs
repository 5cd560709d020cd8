use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use skyport_core::Dimensions;
use skyport_rpc::RetryPolicy;

pub const DEFAULT_SECRET: &str = "skyport-development-secret";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub tokens: TokenConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub automat: AutomatDefaults,
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Seconds to wait for in-flight requests on shutdown
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP API to listen on
    pub http_addr: SocketAddr,
    /// Address for the drone service RPC server to listen on
    pub rpc_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Deserialize)]
pub struct TokenConfig {
    /// HMAC secret shared by every orchestrator replica
    pub secret: String,
    /// Lifetime of identity tokens in seconds
    #[serde(default = "default_identity_ttl")]
    pub identity_ttl_secs: u64,
    /// Lifetime of pickup tokens in seconds
    #[serde(default = "default_pickup_ttl")]
    pub pickup_ttl_secs: u64,
}

impl TokenConfig {
    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_ttl_secs)
    }

    pub fn pickup_ttl(&self) -> Duration {
        Duration::from_secs(self.pickup_ttl_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Retries after the first failed attempt
    pub retry_count: u32,
    /// Base backoff in milliseconds, multiplied by the attempt number
    pub retry_delay_ms: u64,
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AutomatDefaults {
    /// Internal doors created with a new automat when the request names none
    pub internal_doors: u32,
    /// Size of cells created without explicit dimensions, in millimeters
    pub cell_dimensions: Dimensions,
}

impl Default for AutomatDefaults {
    fn default() -> Self {
        Self {
            internal_doors: 3,
            cell_dimensions: Dimensions::new(400, 400, 400),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WorkerConfig {
    /// Interval in seconds between drone assignment passes
    pub assign_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            assign_interval_secs: 5,
        }
    }
}

fn default_grace() -> u64 {
    10
}

fn default_identity_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_pickup_ttl() -> u64 {
    24 * 60 * 60
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
                http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
                rpc_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            },
            storage: StorageConfig::Memory,
            tokens: TokenConfig {
                secret: DEFAULT_SECRET.to_string(),
                identity_ttl_secs: default_identity_ttl(),
                pickup_ttl_secs: default_pickup_ttl(),
            },
            agent: AgentConfig {
                timeout_secs: 10,
                retry_count: 3,
                retry_delay_ms: 1000,
            },
            automat: AutomatDefaults::default(),
            worker: WorkerConfig::default(),
            shutdown_grace_secs: default_grace(),
        }
    }
}
