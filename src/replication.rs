use bytes::Bytes;
use cluster::NodeId;
use storage::{BlockId, MetadataDocument};

use crate::controller::Controller;
use crate::error::Result;
use crate::orchestrator::{digest_matches, UploadReport};

impl Controller {
    /// Writes `replication_factor` extra copies of a freshly placed block.
    ///
    /// Best effort: failures are logged and reported, never rolled back. Only
    /// copies that were written end up in the placements map. Returns the
    /// replica ids that were stored.
    pub(crate) async fn replicate(
        &self,
        document: &mut MetadataDocument,
        id: &BlockId,
        primary: &NodeId,
        payload: &Bytes,
        report: &mut UploadReport,
    ) -> Vec<BlockId> {
        let mut holders = vec![primary.clone()];
        let mut written = Vec::new();

        for k in 1..=self.config.replication_factor {
            let replica_id = id.replica(k);
            let live = self.registry.live_nodes().await;

            let Some(node) = self.placement.place_replica(&live, primary, &holders, k) else {
                tracing::warn!("No live node for replica {}", replica_id);
                report.fail(&replica_id, None, "no live storage nodes");
                continue;
            };

            if holders.contains(&node) {
                tracing::warn!(
                    "Replica {} shares node {} with another copy (only {} live nodes)",
                    replica_id,
                    node,
                    live.len()
                );
            }

            report.replicas_attempted += 1;
            let key = replica_id.to_string();

            match self
                .transport
                .write_block(node.as_str(), &key, payload.clone())
                .await
            {
                Ok(()) => {
                    document.placements.insert(key, node.to_string());
                    self.registry.record_placement(&node).await;
                    report.replicas_written += 1;
                    tracing::debug!("Replica {} stored on {}", replica_id, node);
                    holders.push(node);
                    written.push(replica_id);
                }
                Err(e) => {
                    tracing::warn!("Replicating {} to {} failed: {}", replica_id, node, e);
                    report.fail(&replica_id, Some(&node), e.to_string());
                }
            }
        }

        written
    }

    /// Re-creates every block copy recorded on `dead` on a live node that has
    /// no copy of that block yet, reading from a surviving copy. Returns the
    /// number of copies moved.
    pub async fn repair_node(&self, dead: &NodeId) -> Result<usize> {
        let mut document = self.metadata.lock().await;

        let lost: Vec<BlockId> = document
            .placements
            .iter()
            .filter(|(_, node)| node.as_str() == dead.as_str())
            .filter_map(|(block, _)| block.parse().ok())
            .collect();

        if lost.is_empty() {
            return Ok(0);
        }
        tracing::info!("Re-replicating {} block copies from dead node {}", lost.len(), dead);

        let mut repaired = 0usize;
        for copy in lost {
            let primary = copy.primary_id();
            let entry = document
                .manifests
                .get(copy.file())
                .and_then(|manifest| manifest.blocks.iter().find(|e| e.id == primary))
                .cloned();
            let Some(entry) = entry else {
                tracing::warn!("Block {} belongs to no complete file, skipping", copy);
                continue;
            };

            let live = self.registry.live_nodes().await;
            let holders: Vec<NodeId> = entry
                .copies()
                .filter_map(|c| document.placements.get(&c.to_string()))
                .filter(|node| node.as_str() != dead.as_str())
                .map(|node| NodeId(node.clone()))
                .collect();

            let mut source = None;
            for other in entry.copies().filter(|c| **c != copy) {
                let Some(node) = document.placements.get(&other.to_string()) else {
                    continue;
                };
                if !live.iter().any(|n| n.id.as_str() == node.as_str()) {
                    continue;
                }
                match self.transport.read_block(node, &other.to_string()).await {
                    Ok(Some(data)) if digest_matches(&entry, &data) => {
                        source = Some(data);
                        break;
                    }
                    Ok(_) => tracing::warn!("Copy {} on {} unusable for repair", other, node),
                    Err(e) => tracing::warn!("Reading {} from {} failed: {}", other, node, e),
                }
            }
            let Some(data) = source else {
                tracing::error!("No surviving copy of {}, cannot re-replicate", copy);
                continue;
            };

            let anchor = holders.first().cloned().unwrap_or_else(|| dead.clone());
            let k = copy.replica_index().max(1);
            let target = self
                .placement
                .place_replica(&live, &anchor, &holders, k)
                .filter(|node| !holders.contains(node));
            let Some(target) = target else {
                tracing::warn!("Every live node already holds a copy of {}", primary);
                continue;
            };

            match self
                .transport
                .write_block(target.as_str(), &copy.to_string(), data)
                .await
            {
                Ok(()) => {
                    document.placements.insert(copy.to_string(), target.to_string());
                    self.registry.record_placement(&target).await;
                    self.registry.release_placement(dead).await;
                    repaired += 1;
                    tracing::info!("Moved {} from {} to {}", copy, dead, target);
                }
                Err(e) => tracing::warn!("Re-replicating {} to {} failed: {}", copy, target, e),
            }
        }

        if repaired > 0 {
            self.store.save(&document).await?;
        }

        Ok(repaired)
    }
}
