use cluster::PlacementPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BlockFsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen_addr: String,
    /// Distinct storage nodes required before uploads and downloads are served.
    pub quorum: usize,
    pub chunk_size: usize,
    /// Extra copies written for every block.
    pub replication_factor: u32,
    pub placement: PlacementPolicy,
    pub metadata_path: PathBuf,
    pub download_dir: PathBuf,
    pub heartbeat_interval_ms: u64,
    pub suspect_after_missed: u32,
    pub dead_after_missed: u32,
    pub re_replicate: bool,
    pub purge_on_exit: bool,
    pub interactive: bool,
    /// HTTP operator API; disabled when absent.
    pub http: Option<api::Config>,
    pub network: network::Config,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5001".to_string(),
            quorum: 3,
            chunk_size: 64,
            replication_factor: 1,
            placement: PlacementPolicy::default(),
            metadata_path: PathBuf::from("metadata.json"),
            download_dir: PathBuf::from("."),
            heartbeat_interval_ms: 10_000,
            suspect_after_missed: 2,
            dead_after_missed: 3,
            re_replicate: false,
            purge_on_exit: true,
            interactive: true,
            http: None,
            network: network::Config::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.quorum == 0 {
            return Err(invalid("quorum must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size must be at least 1"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms must be positive"));
        }
        if self.suspect_after_missed == 0 || self.dead_after_missed <= self.suspect_after_missed {
            return Err(invalid(
                "thresholds must satisfy 0 < suspect_after_missed < dead_after_missed",
            ));
        }
        if self.chunk_size > self.network.max_frame_bytes {
            return Err(invalid("chunk_size exceeds network.max_frame_bytes"));
        }
        Ok(())
    }
}

impl From<ControllerConfig> for cluster::Config {
    fn from(config: ControllerConfig) -> Self {
        cluster::Config {
            quorum: config.quorum,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            suspect_after_missed: config.suspect_after_missed,
            dead_after_missed: config.dead_after_missed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the block endpoint binds to and registers as.
    pub listen_addr: String,
    pub controller_addr: String,
    pub data_dir: PathBuf,
    pub heartbeat_interval_ms: u64,
    pub registration_attempts: u32,
    pub registration_backoff_ms: u64,
    pub stats_interval_ms: u64,
    pub network: network::Config,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6000".to_string(),
            controller_addr: "127.0.0.1:5001".to_string(),
            data_dir: PathBuf::from("datanodes"),
            heartbeat_interval_ms: 10_000,
            registration_attempts: 10,
            registration_backoff_ms: 500,
            stats_interval_ms: 60_000,
            network: network::Config::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_host_port()?;
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms must be positive"));
        }
        if self.registration_attempts == 0 {
            return Err(invalid("registration_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Host and port of `listen_addr`. Port 0 binds an ephemeral port, which
    /// is then the one announced to the controller.
    pub fn listen_host_port(&self) -> Result<(String, u16)> {
        let (host, port) = self
            .listen_addr
            .rsplit_once(':')
            .ok_or_else(|| invalid(format!("listen_addr {:?} is not host:port", self.listen_addr)))?;
        let port: u16 = port
            .parse()
            .map_err(|e| invalid(format!("listen_addr port {:?}: {}", port, e)))?;
        if host.is_empty() {
            return Err(invalid(format!(
                "listen_addr {:?} needs an explicit host",
                self.listen_addr
            )));
        }
        Ok((host.to_string(), port))
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path)
        .map_err(|e| invalid(format!("cannot read config {}: {}", path.display(), e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| invalid(format!("cannot parse config {}: {}", path.display(), e)))
}

fn invalid(message: impl Into<String>) -> BlockFsError {
    BlockFsError::InvalidConfig(message.into())
}
