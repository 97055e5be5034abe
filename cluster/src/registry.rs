use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::{ClusterError, Config, NodeId, NodeInfo, NodeStatus, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub node: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Insertion order is the placement order.
    nodes: Vec<NodeInfo>,
    registrations: u64,
}

/// Known storage nodes and the quorum barrier.
///
/// Records are never removed. The barrier tracks the number of distinct
/// nodes, so re-registration of a known node does not move it.
pub struct NodeRegistry {
    state: RwLock<RegistryState>,
    quorum: usize,
    members: watch::Sender<usize>,
}

impl NodeRegistry {
    pub fn new(quorum: usize) -> Self {
        let (members, _) = watch::channel(0);
        Self {
            state: RwLock::new(RegistryState::default()),
            quorum,
            members,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Admits a node, or refreshes it when `host:port` is already known.
    pub async fn register(&self, host: &str, port: u16) -> Result<NodeId> {
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(ClusterError::InvalidAddress(format!("bad host {:?}", host)));
        }
        if port == 0 {
            return Err(ClusterError::InvalidAddress(format!("{}:0", host)));
        }

        let id = NodeId::new(host, port);
        let now = Utc::now();

        let mut state = self.state.write().await;
        match state.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.status = NodeStatus::Alive;
                node.last_seen = now;
                tracing::info!("Node {} registered again", id);
            }
            None => {
                state.nodes.push(NodeInfo {
                    id: id.clone(),
                    host: host.to_string(),
                    port,
                    status: NodeStatus::Alive,
                    last_seen: now,
                    block_count: 0,
                });
                tracing::info!("Node {} registered ({} known)", id, state.nodes.len());
            }
        }
        state.registrations += 1;

        let distinct = state.nodes.len();
        self.members.send_replace(distinct);

        if distinct == self.quorum {
            tracing::info!("Quorum of {} nodes reached", self.quorum);
        }

        Ok(id)
    }

    pub fn has_quorum(&self) -> bool {
        *self.members.borrow() >= self.quorum
    }

    /// Waits until `quorum` distinct nodes have registered.
    pub async fn await_quorum(&self, timeout: Duration) -> Result<()> {
        let mut members = self.members.subscribe();
        let quorum = self.quorum;

        let reached = tokio::time::timeout(timeout, members.wait_for(|n| *n >= quorum)).await;
        match reached {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(ClusterError::QuorumTimeout {
                registered: self.registered_count(),
                required: quorum,
                waited: timeout,
            }),
        }
    }

    /// Distinct registered nodes.
    pub fn registered_count(&self) -> usize {
        *self.members.borrow()
    }

    /// Successful registrations including repeats.
    pub async fn registrations(&self) -> u64 {
        self.state.read().await.registrations
    }

    /// Refreshes liveness; returns the status the node had before.
    pub async fn record_heartbeat(&self, id: &NodeId) -> Result<NodeStatus> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .iter_mut()
            .find(|n| &n.id == id)
            .ok_or_else(|| ClusterError::UnknownNode(id.to_string()))?;

        let previous = node.status;
        node.status = NodeStatus::Alive;
        node.last_seen = Utc::now();

        if previous != NodeStatus::Alive {
            tracing::info!("Node {} is alive again (was {})", id, previous);
        }

        Ok(previous)
    }

    /// Alive nodes in registration order.
    pub async fn live_nodes(&self) -> Vec<NodeInfo> {
        self.state
            .read()
            .await
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Alive)
            .cloned()
            .collect()
    }

    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.state.read().await.nodes.clone()
    }

    pub async fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.state
            .read()
            .await
            .nodes
            .iter()
            .find(|n| &n.id == id)
            .cloned()
    }

    pub async fn record_placement(&self, id: &NodeId) {
        let mut state = self.state.write().await;
        if let Some(node) = state.nodes.iter_mut().find(|n| &n.id == id) {
            node.block_count += 1;
        }
    }

    pub async fn release_placement(&self, id: &NodeId) {
        let mut state = self.state.write().await;
        if let Some(node) = state.nodes.iter_mut().find(|n| &n.id == id) {
            node.block_count = node.block_count.saturating_sub(1);
        }
    }

    /// Rebuilds block counts from a `node -> copies` tally, e.g. after loading metadata.
    pub async fn set_block_counts<'a, I>(&self, placements: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut state = self.state.write().await;
        for node in state.nodes.iter_mut() {
            node.block_count = 0;
        }
        for node_id in placements {
            if let Some(node) = state.nodes.iter_mut().find(|n| n.id.as_str() == node_id) {
                node.block_count += 1;
            }
        }
    }

    /// Demotes nodes that have missed too many heartbeats as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>, config: &Config) -> Vec<StatusChange> {
        let interval_ms = config.heartbeat_interval_ms.max(1) as i64;
        let mut changes = Vec::new();

        let mut state = self.state.write().await;
        for node in state.nodes.iter_mut() {
            let silent_ms = (now - node.last_seen).num_milliseconds().max(0);
            let missed = (silent_ms / interval_ms) as u64;

            let target = if missed >= config.dead_after_missed as u64 {
                NodeStatus::Dead
            } else if missed >= config.suspect_after_missed as u64 {
                NodeStatus::Suspect
            } else {
                node.status
            };

            if target != node.status && node.status != NodeStatus::Dead {
                changes.push(StatusChange {
                    node: node.id.clone(),
                    from: node.status,
                    to: target,
                });
                node.status = target;
            }
        }

        changes
    }
}
