//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//! Precedence is defaults < TOML file < CLI flags.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::elite::AggregationConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Complete coordinator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Opaque GA options forwarded to workers on `prepare`
    #[serde(default)]
    pub ga: Map<String, Value>,
}

/// Listening addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address both servers bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port workers connect to
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    /// Port observers connect to (WebSocket)
    #[serde(default = "default_observer_port")]
    pub observer_port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_worker_port() -> u16 {
    12345
}

fn default_observer_port() -> u16 {
    8000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            worker_port: default_worker_port(),
            observer_port: default_observer_port(),
        }
    }
}

impl NetworkConfig {
    pub fn worker_listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.worker_port)
    }

    pub fn observer_listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.observer_port)
    }
}

/// Elite list persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// File used by save_e/restore_e when no filename is given
    #[serde(default = "default_elites_file")]
    pub elites_file: PathBuf,
}

fn default_elites_file() -> PathBuf {
    PathBuf::from("elites.msgpack")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            elites_file: default_elites_file(),
        }
    }
}

/// Runtime behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// How long `exit` waits for workers to disconnect before forcing
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Read commands typed on stdin
    #[serde(default = "default_operator_input")]
    pub operator_input: bool,
}

fn default_shutdown_timeout_secs() -> u64 {
    300
}

fn default_operator_input() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            operator_input: default_operator_input(),
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elite::OptimizeDirection;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.network.worker_listen_addr(), "0.0.0.0:12345");
        assert_eq!(config.network.observer_listen_addr(), "0.0.0.0:8000");
        assert_eq!(config.aggregation.optimize, OptimizeDirection::Max);
        assert!(!config.aggregation.is_enabled());
        assert_eq!(config.runtime.shutdown_timeout(), Duration::from_secs(300));
        assert_eq!(config.persistence.elites_file, PathBuf::from("elites.msgpack"));
    }
}
