use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use skyport_rpc::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Seconds to wait for in-flight work on shutdown
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address drones connect to with newline-delimited JSON telemetry
    pub telemetry_addr: SocketAddr,
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    /// Address of the orchestrator RPC server
    pub rpc_addr: SocketAddr,
    /// Per-call timeout in seconds
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

#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    /// Seconds between task polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound on tasks fetched per poll
    #[serde(default = "default_max_tasks")]
    pub max_tasks: u32,
    /// Polls a task may wait for its drone to connect before it is failed
    #[serde(default = "default_dispatch_attempts")]
    pub max_dispatch_attempts: u32,
    /// Landing marker drones return to after a delivery
    #[serde(default)]
    pub base_marker_id: u32,
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_tasks: default_max_tasks(),
            max_dispatch_attempts: default_dispatch_attempts(),
            base_marker_id: 0,
        }
    }
}

fn default_grace() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    2
}

fn default_max_tasks() -> u32 {
    16
}

fn default_dispatch_attempts() -> u32 {
    30
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
                telemetry_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
                http_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            },
            orchestrator: OrchestratorConfig {
                rpc_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
                timeout_secs: 5,
                retry_count: 3,
                retry_delay_ms: 1000,
            },
            dispatch: DispatchConfig::default(),
            shutdown_grace_secs: default_grace(),
        }
    }
}
