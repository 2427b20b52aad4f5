//! Configuration types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Control port and peer port must differ (both are {0})")]
    PortConflict(u16),

    #[error("A tunnel needs at least one intermediate hop")]
    NoHops,

    #[error("Failed to read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Unparsable {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Relay settings, filled from flags and optionally a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Interface both listeners bind to.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Control-client listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Relay-to-relay listener port. Must differ from `port`.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Path to the hostkey secret file.
    #[serde(default = "default_hostkey")]
    pub hostkey: PathBuf,

    /// Minimum number of intermediate hops per tunnel.
    #[serde(default = "default_min_hops")]
    pub min_hops: u8,

    /// Address of the random peer sampling service.
    #[serde(default = "default_rps_addr")]
    pub rps_addr: String,

    /// Timeout for connects and awaited responses, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9010
}

fn default_api_port() -> u16 {
    9020
}

fn default_hostkey() -> PathBuf {
    PathBuf::from("hostkey")
}

fn default_min_hops() -> u8 {
    2
}

fn default_rps_addr() -> String {
    "127.0.0.1:9030".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            api_port: default_api_port(),
            hostkey: default_hostkey(),
            min_hops: default_min_hops(),
            rps_addr: default_rps_addr(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Config {
    /// Load settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Unparsable {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Port 0 asks the OS for an ephemeral port, so it cannot collide.
        if self.port != 0 && self.port == self.api_port {
            return Err(ConfigError::PortConflict(self.port));
        }
        if self.min_hops == 0 {
            return Err(ConfigError::NoHops);
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Bind address of the control listener.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Bind address of the peer listener.
    pub fn peer_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.api_port)
    }
}
