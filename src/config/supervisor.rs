use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Worker supervision configuration (see `supervisor` table in config.toml).
///
/// The `*_seconds` fields map 1:1 onto the `STARTUP_TIMEOUT_SECONDS`,
/// `HEALTH_INTERVAL_SECONDS` and `RECONCILE_INTERVAL_SECONDS` environment
/// overrides; `PORT_RANGE_LOW`/`PORT_RANGE_HIGH` override the port range.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Lowest port handed to workers (inclusive).
    #[serde(default = "default_port_range_low")]
    pub port_range_low: u16,

    /// Highest port handed to workers (inclusive).
    #[serde(default = "default_port_range_high")]
    pub port_range_high: u16,

    /// Total budget for a worker to reach `ready` after spawn.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,

    /// Cadence of the health pass over `ready` workers.
    #[serde(default = "default_health_interval")]
    pub health_interval_seconds: u64,

    /// Cadence of the store/worker reconciliation pass.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,

    /// Grace between SIGTERM and SIGKILL on Stop.
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_seconds: u64,

    /// Global budget for stopping all workers on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// Per-request deadline for health and protocol probes.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    /// Start attempts before an instance is marked failed.
    #[serde(default = "default_max_start_retries")]
    pub max_start_retries: u32,

    /// Root of the per-instance log tree
    /// (`<log_root>/users/user_<user_id>/mcp_<instance_id>/`).
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_seconds)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port_range_low: default_port_range_low(),
            port_range_high: default_port_range_high(),
            startup_timeout_seconds: default_startup_timeout(),
            health_interval_seconds: default_health_interval(),
            reconcile_interval_seconds: default_reconcile_interval(),
            terminate_grace_seconds: default_terminate_grace(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            probe_timeout_seconds: default_probe_timeout(),
            max_start_retries: default_max_start_retries(),
            log_root: default_log_root(),
        }
    }
}

fn default_port_range_low() -> u16 {
    49200
}

fn default_port_range_high() -> u16 {
    49500
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    60
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_terminate_grace() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_max_start_retries() -> u32 {
    3
}

fn default_log_root() -> PathBuf {
    PathBuf::from("logs")
}
