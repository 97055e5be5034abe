pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod node;
pub mod orchestrator;
mod replication;

pub use config::{ControllerConfig, NodeConfig};
pub use controller::{Controller, Phase};
pub use error::{BlockFsError, Result};
pub use node::{NodePhase, StorageNode};
pub use orchestrator::{validate_file_name, BlockFailure, UploadReport};

// Re-export key types from workspace crates
pub use api;
pub use cluster;
pub use network;
pub use storage;
pub use system;
