use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::block::BlockMeta;
use crate::{Result, StorageError, StorageStats};

const MAX_BLOCK_ID_LEN: usize = 255;

/// Field separator of the node wire protocol; an id containing it cannot be addressed.
const FIELD_DELIMITER: &str = "?>?";

/// Local block store of a storage node.
///
/// Layout under the root directory:
/// `blocks/<id>` holds the payload, `meta/<id>.json` its checksum sidecar and
/// `tmp/` is the staging area for atomic writes.
pub struct BlockStore {
    root: PathBuf,
    blocks_dir: PathBuf,
    meta_dir: PathBuf,
    tmp_dir: PathBuf,
    tmp_counter: AtomicU64,
    stats: RwLock<StorageStats>,
}

impl BlockStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let blocks_dir = root.join("blocks");
        let meta_dir = root.join("meta");
        let tmp_dir = root.join("tmp");

        fs::create_dir_all(&blocks_dir).await?;
        fs::create_dir_all(&meta_dir).await?;
        fs::create_dir_all(&tmp_dir).await?;

        let store = Self {
            root,
            blocks_dir,
            meta_dir,
            tmp_dir,
            tmp_counter: AtomicU64::new(0),
            stats: RwLock::new(StorageStats::default()),
        };

        store.refresh_stats().await?;

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Periodically recomputes usage statistics from disk.
    pub async fn run_stats_loop(&self, every: Duration) -> Result<()> {
        let mut interval = tokio::time::interval(every);

        loop {
            interval.tick().await;
            match self.refresh_stats().await {
                Ok(stats) => tracing::info!(
                    "Block store {:?}: {} blocks, {} bytes",
                    self.root,
                    stats.block_count,
                    stats.used_bytes
                ),
                Err(e) => tracing::error!("Failed to update block store stats: {}", e),
            }
        }
    }

    /// Stores `data` under `id`, replacing any previous payload.
    pub async fn write_block(&self, id: &str, data: Bytes) -> Result<BlockMeta> {
        let block_path = self.block_path(id)?;
        let meta_path = self.meta_path(id)?;
        let meta = BlockMeta::new(id, &data);
        let meta_json = serde_json::to_vec_pretty(&meta)?;
        let previous = stored_len(&block_path).await?;

        self.atomic_write(&block_path, &data).await?;
        self.atomic_write(&meta_path, &meta_json).await?;

        {
            let mut stats = self.stats.write().await;
            match previous {
                Some(len) => stats.used_bytes = stats.used_bytes.saturating_sub(len),
                None => stats.block_count += 1,
            }
            stats.used_bytes += data.len() as u64;
        }
        tracing::debug!("Stored block {} ({} bytes)", id, data.len());

        Ok(meta)
    }

    /// Returns the payload stored under `id` after checking it against its sidecar.
    pub async fn read_block(&self, id: &str) -> Result<Bytes> {
        let block_path = self.block_path(id)?;

        let data = match fs::read(&block_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::BlockNotFound(id.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        match self.read_meta(id).await? {
            Some(meta) if !meta.verify(&data) => {
                return Err(StorageError::Corruption(format!(
                    "block {} failed integrity check",
                    id
                )));
            }
            Some(_) => {}
            None => tracing::warn!("Block {} has no checksum sidecar, serving unverified", id),
        }

        Ok(Bytes::from(data))
    }

    pub async fn delete_block(&self, id: &str) -> Result<()> {
        let block_path = self.block_path(id)?;
        let meta_path = self.meta_path(id)?;
        let Some(len) = stored_len(&block_path).await? else {
            return Err(StorageError::BlockNotFound(id.to_string()));
        };

        match fs::remove_file(&block_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::BlockNotFound(id.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        }

        if let Err(e) = fs::remove_file(&meta_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(StorageError::Io(e));
            }
        }

        {
            let mut stats = self.stats.write().await;
            stats.block_count = stats.block_count.saturating_sub(1);
            stats.used_bytes = stats.used_bytes.saturating_sub(len);
        }
        tracing::debug!("Deleted block {}", id);

        Ok(())
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.block_path(id)?).await?)
    }

    /// Counters kept up to date by writes and deletes; [`refresh_stats`](Self::refresh_stats)
    /// rescans the directory and corrects any drift.
    pub async fn stats(&self) -> StorageStats {
        self.stats.read().await.clone()
    }

    pub async fn refresh_stats(&self) -> Result<StorageStats> {
        let mut block_count = 0u64;
        let mut used_bytes = 0u64;

        let mut entries = fs::read_dir(&self.blocks_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                block_count += 1;
                used_bytes += metadata.len();
            }
        }

        let stats = StorageStats {
            block_count,
            used_bytes,
        };
        *self.stats.write().await = stats.clone();

        Ok(stats)
    }

    async fn read_meta(&self, id: &str) -> Result<Option<BlockMeta>> {
        match fs::read(self.meta_path(id)?).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn atomic_write(&self, dest: &Path, data: &[u8]) -> Result<()> {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self.tmp_dir.join(format!("{}.{}.tmp", std::process::id(), n));

        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }

        if let Err(e) = fs::rename(&tmp, dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::Io(e));
        }

        Ok(())
    }

    fn block_path(&self, id: &str) -> Result<PathBuf> {
        validate_block_id(id)?;
        Ok(self.blocks_dir.join(id))
    }

    fn meta_path(&self, id: &str) -> Result<PathBuf> {
        validate_block_id(id)?;
        Ok(self.meta_dir.join(format!("{}.json", id)))
    }
}

async fn stored_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Block ids become file names, so anything that could escape the store is refused.
fn validate_block_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id.len() > MAX_BLOCK_ID_LEN
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0'])
        || id.contains(FIELD_DELIMITER);

    if bad {
        return Err(StorageError::InvalidBlockId(id.to_string()));
    }
    Ok(())
}
