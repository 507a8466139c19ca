use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use crate::error::{ControllerError, Result};

fn default_sweep_interval_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub replication_factor: usize,
    pub timeout_ms: u64,
    pub rebalance_period_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config {
    pub fn new(port: u16, replication_factor: usize, timeout_ms: u64, rebalance_period_ms: u64) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            replication_factor,
            timeout_ms,
            rebalance_period_ms,
            sweep_interval_ms: default_sweep_interval_ms(),
            log_level: default_log_level(),
        }
    }

    /// Reads a JSON document; missing optional fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| {
            ControllerError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(ControllerError::InvalidConfig(
                "replication factor must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ControllerError::InvalidConfig("timeout must be positive".to_string()));
        }
        if self.rebalance_period_ms == 0 {
            return Err(ControllerError::InvalidConfig(
                "rebalance period must be positive".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ControllerError::InvalidConfig(
                "sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rebalance_period(&self) -> Duration {
        Duration::from_millis(self.rebalance_period_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
