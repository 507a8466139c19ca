mod engine;
mod server;

pub use engine::StorageEngine;
pub use server::Dstore;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings of one storage node process.
///
/// Peers are reached on `controller_host`; every process of a deployment is
/// told apart by its port alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub controller_host: String,
    pub controller_port: u16,
    pub timeout_ms: u64,
    pub folder: PathBuf,
}

impl Config {
    pub fn new(port: u16, controller_port: u16, timeout_ms: u64, folder: impl Into<PathBuf>) -> Self {
        Self {
            port,
            controller_host: "127.0.0.1".to_string(),
            controller_port,
            timeout_ms,
            folder: folder.into(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn controller_address(&self) -> String {
        format!("{}:{}", self.controller_host, self.controller_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(StorageError::InvalidConfig("timeout must be positive".to_string()));
        }
        if self.controller_port == 0 {
            return Err(StorageError::InvalidConfig("controller port must be set".to_string()));
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}
