//! Daemon configuration

use portguard_core::{ConfigError, ControllerConfig, PolicyConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Daemon configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Switch channel listen address
    pub listen_addr: String,
    /// CSV telemetry log
    pub stats_log_path: PathBuf,
    /// Decision policy
    pub policy: PolicyConfig,
    /// Core tunables
    pub controller: ControllerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6653".into(),
            stats_log_path: PathBuf::from("logs/stats_log.csv"),
            policy: PolicyConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError(format!("invalid listen_addr {:?}: {}", self.listen_addr, e)))
    }

    /// Check everything that would otherwise fail at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.controller.validate()?;
        self.policy.build()?;
        Ok(())
    }
}
