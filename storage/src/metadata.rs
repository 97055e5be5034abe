use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::block::BlockId;
use crate::{Result, StorageError};

/// Durable controller metadata: where every block copy lives and the ordered
/// block list of every completely uploaded file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataDocument {
    /// block id -> node id (`host:port`)
    #[serde(default)]
    pub placements: BTreeMap<String, String>,
    #[serde(default)]
    pub manifests: BTreeMap<String, FileManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_name: String,
    pub size: u64,
    pub chunk_size: u64,
    /// Primary blocks in sequence order.
    pub blocks: Vec<BlockEntry>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub id: BlockId,
    pub size: u64,
    /// blake3 of the payload; absent for manifests rebuilt from legacy documents.
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub replicas: Vec<BlockId>,
}

impl BlockEntry {
    /// Primary copy first, then replicas in index order.
    pub fn copies(&self) -> impl Iterator<Item = &BlockId> {
        std::iter::once(&self.id).chain(self.replicas.iter())
    }
}

impl FileManifest {
    pub fn block_ids(&self) -> impl Iterator<Item = &BlockId> {
        self.blocks.iter().map(|entry| &entry.id)
    }
}

impl MetadataDocument {
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.manifests.is_empty()
    }

    /// Builds a document from the flat `block id -> node id` layout, recovering
    /// each file's block order from the sequence number embedded in the ids.
    pub fn from_flat(placements: BTreeMap<String, String>) -> Self {
        let mut grouped: BTreeMap<String, BTreeMap<u64, BlockEntry>> = BTreeMap::new();
        let mut replicas: Vec<BlockId> = Vec::new();

        for raw in placements.keys() {
            let id: BlockId = match raw.parse() {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!("Skipping unrecognised block id {} in metadata", raw);
                    continue;
                }
            };

            if id.is_replica() {
                replicas.push(id);
                continue;
            }

            grouped
                .entry(id.file().to_string())
                .or_default()
                .insert(
                    id.sequence(),
                    BlockEntry {
                        id,
                        size: 0,
                        digest: None,
                        replicas: Vec::new(),
                    },
                );
        }

        replicas.sort();
        for replica in replicas {
            if let Some(entry) = grouped
                .get_mut(replica.file())
                .and_then(|blocks| blocks.get_mut(&replica.sequence()))
            {
                entry.replicas.push(replica);
            }
        }

        let manifests = grouped
            .into_iter()
            .map(|(file_name, blocks)| {
                let manifest = FileManifest {
                    file_name: file_name.clone(),
                    size: 0,
                    chunk_size: 0,
                    blocks: blocks.into_values().collect(),
                    uploaded_at: Utc::now(),
                };
                (file_name, manifest)
            })
            .collect();

        Self {
            placements,
            manifests,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Current(MetadataDocument),
    Flat(BTreeMap<String, String>),
}

/// JSON-file persistence for [`MetadataDocument`].
///
/// Every save rewrites the whole document through a temporary file and a
/// rename, with all writers serialized on one lock.
pub struct MetadataStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document; a missing file is an empty document.
    pub async fn load(&self) -> Result<MetadataDocument> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No metadata at {:?}, starting empty", self.path);
                return Ok(MetadataDocument::default());
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let document = match serde_json::from_slice::<OnDisk>(&raw)? {
            OnDisk::Current(document) => document,
            OnDisk::Flat(placements) => {
                tracing::info!(
                    "Converting flat metadata with {} placements from {:?}",
                    placements.len(),
                    self.path
                );
                MetadataDocument::from_flat(placements)
            }
        };

        tracing::info!(
            "Loaded metadata: {} placements, {} files",
            document.placements.len(),
            document.manifests.len()
        );

        Ok(document)
    }

    pub async fn save(&self, document: &MetadataDocument) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(document)?;
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, &self.path).await?;

        tracing::debug!(
            "Saved metadata ({} placements) to {:?}",
            document.placements.len(),
            self.path
        );

        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.save(&MetadataDocument::default()).await
    }
}
