mod error;
mod handlers;
mod server;

pub use error::{ApiError, ApiResult};
pub use server::Server;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cluster::NodeInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Operations the HTTP surface exposes. Implemented by the controller.
#[async_trait]
pub trait FileService: Send + Sync + 'static {
    async fn status(&self) -> ClusterStatus;

    async fn nodes(&self) -> Vec<NodeInfo>;

    async fn files(&self) -> Vec<FileSummary>;

    async fn upload(&self, name: &str, data: Bytes) -> ApiResult<UploadSummary>;

    async fn download(&self, name: &str) -> ApiResult<Bytes>;

    async fn shutdown(&self) -> ApiResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterStatus {
    pub phase: String,
    pub registered_nodes: usize,
    pub required_nodes: usize,
    pub registrations: u64,
    pub placement: String,
    pub replication_factor: u32,
    pub nodes: Vec<NodeInfo>,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSummary {
    pub name: String,
    pub size: u64,
    pub blocks: usize,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSummary {
    pub file_name: String,
    pub size: u64,
    pub blocks: usize,
    pub replicas_written: usize,
    pub failures: Vec<String>,
}
