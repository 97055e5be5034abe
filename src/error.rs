use std::path::PathBuf;
use thiserror::Error;

use crate::orchestrator::UploadReport;

#[derive(Error, Debug)]
pub enum BlockFsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("System error: {0}")]
    System(#[from] system::SystemError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Quorum not reached: {registered} of {required} storage nodes registered")]
    QuorumNotReached { registered: usize, required: usize },

    #[error("File '{0}' already exists")]
    FileAlreadyExists(String),

    #[error("Source file {} does not exist", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("File '{name}' does not exist; known files: [{}]", .known.join(", "))]
    FileNotFound { name: String, known: Vec<String> },

    #[error(
        "Upload of '{}' incomplete: {} of {} blocks stored",
        .0.file_name,
        .0.blocks_placed,
        .0.blocks_total
    )]
    IncompleteUpload(Box<UploadReport>),

    #[error("No readable copy of block {0}")]
    BlockUnavailable(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Controller is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, BlockFsError>;

impl From<BlockFsError> for api::ApiError {
    fn from(err: BlockFsError) -> Self {
        use api::ApiError;

        match err {
            BlockFsError::FileNotFound { .. } => ApiError::NotFound(err.to_string()),
            BlockFsError::FileAlreadyExists(_) => ApiError::Conflict(err.to_string()),
            BlockFsError::InvalidFileName(_) | BlockFsError::SourceNotFound(_) => {
                ApiError::InvalidRequest(err.to_string())
            }
            BlockFsError::QuorumNotReached { .. } | BlockFsError::ShuttingDown => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            BlockFsError::IncompleteUpload(_) | BlockFsError::BlockUnavailable(_) => {
                ApiError::BadGateway(err.to_string())
            }
            BlockFsError::Api(inner) => inner,
            other => ApiError::InternalError(other.to_string()),
        }
    }
}
