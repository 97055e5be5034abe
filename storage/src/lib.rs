mod block;
mod engine;
mod metadata;

pub use block::{partition, BlockId, BlockMeta, Checksum};
pub use engine::BlockStore;
pub use metadata::{BlockEntry, FileManifest, MetadataDocument, MetadataStore};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageStats {
    pub block_count: u64,
    pub used_bytes: u64,
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid block id: {0}")]
    InvalidBlockId(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
