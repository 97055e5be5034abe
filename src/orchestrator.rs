use bytes::{Bytes, BytesMut};
use chrono::Utc;
use cluster::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use storage::{partition, BlockEntry, BlockId, Checksum, FileManifest, MetadataDocument};

use crate::controller::Controller;
use crate::error::{BlockFsError, Result};

/// Outcome of one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReport {
    pub file_name: String,
    pub size: u64,
    pub blocks_total: usize,
    /// Primary blocks stored on some node.
    pub blocks_placed: usize,
    pub replicas_attempted: usize,
    pub replicas_written: usize,
    pub failures: Vec<BlockFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFailure {
    pub block_id: String,
    /// Node the write was sent to; absent when no node could be chosen.
    pub node: Option<String>,
    pub reason: String,
}

impl UploadReport {
    fn new(file_name: &str, size: usize, blocks_total: usize) -> Self {
        Self {
            file_name: file_name.to_string(),
            size: size as u64,
            blocks_total,
            blocks_placed: 0,
            replicas_attempted: 0,
            replicas_written: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks_placed == self.blocks_total
    }

    pub(crate) fn fail(&mut self, block_id: &BlockId, node: Option<&NodeId>, reason: impl Into<String>) {
        self.failures.push(BlockFailure {
            block_id: block_id.to_string(),
            node: node.map(|n| n.to_string()),
            reason: reason.into(),
        });
    }

    pub fn summary(&self) -> api::UploadSummary {
        api::UploadSummary {
            file_name: self.file_name.clone(),
            size: self.size,
            blocks: self.blocks_placed,
            replicas_written: self.replicas_written,
            failures: self
                .failures
                .iter()
                .map(|f| match &f.node {
                    Some(node) => format!("{} on {}: {}", f.block_id, node, f.reason),
                    None => format!("{}: {}", f.block_id, f.reason),
                })
                .collect(),
        }
    }
}

/// File names become block id prefixes and local file names on download.
pub fn validate_file_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > 200
        || name.contains(['/', '\\', '\0'])
        || name.contains(network::DELIMITER)
        || name.chars().any(char::is_whitespace);

    if bad {
        return Err(BlockFsError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

impl Controller {
    /// Uploads the local file at `path` under `name`.
    pub async fn upload_file(&self, path: &Path, name: &str) -> Result<UploadReport> {
        validate_file_name(name)?;
        self.ensure_operational()?;

        if self.metadata.lock().await.manifests.contains_key(name) {
            return Err(BlockFsError::FileAlreadyExists(name.to_string()));
        }
        if !tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false) {
            return Err(BlockFsError::SourceNotFound(path.to_path_buf()));
        }

        let data = tokio::fs::read(path).await?;
        tracing::info!("Uploading {} from {:?} ({} bytes)", name, path, data.len());

        self.upload_bytes(name, Bytes::from(data)).await
    }

    /// Splits `data` into blocks, places and replicates each one in sequence
    /// order, then persists the metadata.
    pub async fn upload_bytes(&self, name: &str, data: Bytes) -> Result<UploadReport> {
        validate_file_name(name)?;
        self.ensure_operational()?;

        let mut document = self.metadata.lock().await;
        self.ensure_operational()?;
        if document.manifests.contains_key(name) {
            return Err(BlockFsError::FileAlreadyExists(name.to_string()));
        }

        let blocks = partition(name, &data, self.config.chunk_size);
        let mut report = UploadReport::new(name, data.len(), blocks.len());
        let mut entries = Vec::with_capacity(blocks.len());

        for (id, payload) in blocks {
            let Some(primary) = self.place_primary(&mut document, &id, &payload, &mut report).await
            else {
                continue;
            };
            report.blocks_placed += 1;

            let replicas = self
                .replicate(&mut document, &id, &primary, &payload, &mut report)
                .await;

            entries.push(BlockEntry {
                id,
                size: payload.len() as u64,
                digest: Some(Checksum::digest(&payload)),
                replicas,
            });
        }

        if report.is_complete() {
            document.manifests.insert(
                name.to_string(),
                FileManifest {
                    file_name: name.to_string(),
                    size: data.len() as u64,
                    chunk_size: self.config.chunk_size as u64,
                    blocks: entries,
                    uploaded_at: Utc::now(),
                },
            );
        }

        self.store.save(&document).await?;

        if !report.is_complete() {
            tracing::error!(
                "Upload of {} incomplete: {} of {} blocks stored",
                name,
                report.blocks_placed,
                report.blocks_total
            );
            return Err(BlockFsError::IncompleteUpload(Box::new(report)));
        }

        tracing::info!(
            "File {} uploaded: {} blocks, {} replicas, {} failed writes",
            name,
            report.blocks_total,
            report.replicas_written,
            report.failures.len()
        );

        Ok(report)
    }

    /// Writes a primary block to the node the strategy picks, falling over to
    /// the next live node on failure. The placement is recorded before each
    /// attempt.
    async fn place_primary(
        &self,
        document: &mut MetadataDocument,
        id: &BlockId,
        payload: &Bytes,
        report: &mut UploadReport,
    ) -> Option<NodeId> {
        let live = self.registry.live_nodes().await;
        let Some(first) = self.placement.place_primary(&live) else {
            tracing::error!("No live node for block {}", id);
            report.fail(id, None, "no live storage nodes");
            return None;
        };

        let start = live.iter().position(|n| n.id == first).unwrap_or(0);
        let block_id = id.to_string();

        for offset in 0..live.len() {
            let node = &live[(start + offset) % live.len()].id;
            document.placements.insert(block_id.clone(), node.to_string());

            match self
                .transport
                .write_block(node.as_str(), &block_id, payload.clone())
                .await
            {
                Ok(()) => {
                    self.registry.record_placement(node).await;
                    tracing::debug!("Block {} ({} bytes) stored on {}", block_id, payload.len(), node);
                    return Some(node.clone());
                }
                Err(e) => {
                    tracing::warn!("Writing block {} to {} failed: {}", block_id, node, e);
                    report.fail(id, Some(node), e.to_string());
                }
            }
        }

        None
    }

    /// Reassembles a file from its blocks in sequence order.
    pub async fn download_bytes(&self, name: &str) -> Result<Bytes> {
        self.ensure_operational()?;

        let (manifest, locations) = {
            let document = self.metadata.lock().await;
            let manifest = match document.manifests.get(name) {
                Some(manifest) => manifest.clone(),
                None => {
                    return Err(BlockFsError::FileNotFound {
                        name: name.to_string(),
                        known: document.manifests.keys().cloned().collect(),
                    })
                }
            };
            let locations: Vec<Vec<(BlockId, Option<String>)>> = manifest
                .blocks
                .iter()
                .map(|entry| {
                    entry
                        .copies()
                        .map(|copy| (copy.clone(), document.placements.get(&copy.to_string()).cloned()))
                        .collect()
                })
                .collect();
            (manifest, locations)
        };

        let mut buf = BytesMut::with_capacity(manifest.size as usize);
        for (entry, copies) in manifest.blocks.iter().zip(locations) {
            let data = self.fetch_block(entry, &copies).await?;
            buf.extend_from_slice(&data);
        }

        if manifest.size > 0 && buf.len() as u64 != manifest.size {
            tracing::warn!(
                "Downloaded {} bytes for {}, manifest says {}",
                buf.len(),
                name,
                manifest.size
            );
        }

        tracing::info!("File {} downloaded ({} bytes)", name, buf.len());
        Ok(buf.freeze())
    }

    /// Downloads `name` into `dir` as `downloaded_{name}`.
    pub async fn download_to(&self, name: &str, dir: &Path) -> Result<PathBuf> {
        let data = self.download_bytes(name).await?;
        // Stored names passed validation on upload; legacy documents may not have.
        validate_file_name(name)?;

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("downloaded_{}", name));
        tokio::fs::write(&path, &data).await?;

        tracing::info!("Saved {} as {:?}", name, path);
        Ok(path)
    }

    pub async fn list_files(&self) -> Vec<api::FileSummary> {
        self.metadata
            .lock()
            .await
            .manifests
            .values()
            .map(|manifest| api::FileSummary {
                name: manifest.file_name.clone(),
                size: manifest.size,
                blocks: manifest.blocks.len(),
                uploaded_at: manifest.uploaded_at,
            })
            .collect()
    }

    /// First readable copy that matches the recorded digest: primary, then replicas.
    async fn fetch_block(
        &self,
        entry: &BlockEntry,
        copies: &[(BlockId, Option<String>)],
    ) -> Result<Bytes> {
        for (copy, node) in copies {
            let Some(node) = node else {
                tracing::warn!("No recorded location for block {}", copy);
                continue;
            };

            match self.transport.read_block(node, &copy.to_string()).await {
                Ok(Some(data)) if digest_matches(entry, &data) => {
                    if copy.is_replica() {
                        tracing::info!("Served block {} from replica {} on {}", entry.id, copy, node);
                    }
                    return Ok(data);
                }
                Ok(Some(_)) => tracing::warn!("Block {} on {} failed digest check", copy, node),
                Ok(None) => tracing::warn!("Block {} not found on {}", copy, node),
                Err(e) => tracing::warn!("Reading block {} from {} failed: {}", copy, node, e),
            }
        }

        Err(BlockFsError::BlockUnavailable(entry.id.to_string()))
    }
}

pub(crate) fn digest_matches(entry: &BlockEntry, data: &[u8]) -> bool {
    match &entry.digest {
        Some(digest) => Checksum::digest(data) == *digest,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_that_escape_are_rejected() {
        for name in ["", ".", "..", "a/b", "a\\b", "with space"] {
            assert!(validate_file_name(name).is_err(), "{:?} should be rejected", name);
        }
        validate_file_name("report_block_1.txt").unwrap();
    }

    #[test]
    fn file_names_with_the_field_delimiter_are_rejected() {
        for name in ["evil?>?name", "?>?", "trailing?>?"] {
            assert!(matches!(
                validate_file_name(name),
                Err(BlockFsError::InvalidFileName(_))
            ));
        }
        validate_file_name("what?.txt").unwrap();
    }

    #[test]
    fn summary_lists_failures() {
        let mut report = UploadReport::new("f", 130, 3);
        report.blocks_placed = 3;
        report.fail(
            &BlockId::primary("f", 2).replica(1),
            Some(&NodeId::from("n:1")),
            "timeout",
        );

        let summary = report.summary();
        assert!(report.is_complete());
        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.failures, vec!["f_block_2_Replica on n:1: timeout".to_string()]);
    }
}
