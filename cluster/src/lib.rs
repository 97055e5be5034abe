mod liveness;
mod placement;
mod registry;

pub use liveness::FailureDetector;
pub use placement::{LeastLoaded, PlacementPolicy, PlacementStrategy, Random, RoundRobin};
pub use registry::{NodeRegistry, StatusChange};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Storage node identity, always `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    /// Block copies placed on this node by the controller.
    pub block_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Alive => "alive",
            NodeStatus::Suspect => "suspect",
            NodeStatus::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Distinct nodes required before the cluster is operational.
    pub quorum: usize,
    pub heartbeat_interval_ms: u64,
    pub suspect_after_missed: u32,
    pub dead_after_missed: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quorum: 3,
            heartbeat_interval_ms: 10_000,
            suspect_after_missed: 2,
            dead_after_missed: 3,
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Invalid node address: {0}")]
    InvalidAddress(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Quorum not reached within {waited:?}: {registered} of {required} nodes")]
    QuorumTimeout {
        registered: usize,
        required: usize,
        waited: Duration,
    },

    #[error("Unknown placement policy: {0}")]
    UnknownPolicy(String),
}
