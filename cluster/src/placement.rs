use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{ClusterError, NodeId, NodeInfo};

/// Chooses storage nodes for blocks. Callers pass only live nodes, in
/// registration order.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn place_primary(&self, live: &[NodeInfo]) -> Option<NodeId>;

    /// Node for replica copy `k` (1-based) of a block whose primary went to
    /// `primary`. Nodes in `holders` already have a copy and are avoided
    /// unless every live node is a holder.
    fn place_replica(
        &self,
        live: &[NodeInfo],
        primary: &NodeId,
        holders: &[NodeId],
        k: u32,
    ) -> Option<NodeId>;

    /// Restores position after a restart from the persisted placements:
    /// `primaries` primary blocks and `copies` entries in total.
    fn resume(&self, _primaries: usize, _copies: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementPolicy {
    #[default]
    RoundRobin,
    /// Replica decisions advance the same counter as primaries, which skews
    /// primary distribution whenever the replication factor is non-zero.
    RoundRobinCoupled,
    LeastLoaded,
    Random,
}

impl PlacementPolicy {
    pub fn build(self) -> Box<dyn PlacementStrategy> {
        match self {
            PlacementPolicy::RoundRobin => Box::new(RoundRobin::new()),
            PlacementPolicy::RoundRobinCoupled => Box::new(RoundRobin::coupled()),
            PlacementPolicy::LeastLoaded => Box::new(LeastLoaded),
            PlacementPolicy::Random => Box::new(Random),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PlacementPolicy::RoundRobin => "round-robin",
            PlacementPolicy::RoundRobinCoupled => "round-robin-coupled",
            PlacementPolicy::LeastLoaded => "least-loaded",
            PlacementPolicy::Random => "random",
        }
    }
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacementPolicy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(PlacementPolicy::RoundRobin),
            "round-robin-coupled" => Ok(PlacementPolicy::RoundRobinCoupled),
            "least-loaded" => Ok(PlacementPolicy::LeastLoaded),
            "random" => Ok(PlacementPolicy::Random),
            other => Err(ClusterError::UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
    coupled: bool,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coupled() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            coupled: true,
        }
    }
}

impl PlacementStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        if self.coupled {
            "round-robin-coupled"
        } else {
            "round-robin"
        }
    }

    fn place_primary(&self, live: &[NodeInfo]) -> Option<NodeId> {
        if live.is_empty() {
            return None;
        }
        let slot = self.counter.fetch_add(1, Ordering::Relaxed) % live.len();
        Some(live[slot].id.clone())
    }

    fn place_replica(
        &self,
        live: &[NodeInfo],
        primary: &NodeId,
        holders: &[NodeId],
        k: u32,
    ) -> Option<NodeId> {
        if live.is_empty() {
            return None;
        }

        let start = if self.coupled {
            self.counter.fetch_add(1, Ordering::Relaxed)
        } else {
            let base = live.iter().position(|n| &n.id == primary).unwrap_or(0);
            base + k as usize
        };

        first_free_from(live, start, holders)
    }

    fn resume(&self, primaries: usize, copies: usize) {
        let position = if self.coupled { copies } else { primaries };
        self.counter.store(position, Ordering::Relaxed);
    }
}

/// Node with the fewest placed blocks; ties go to the earlier registration.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl PlacementStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn place_primary(&self, live: &[NodeInfo]) -> Option<NodeId> {
        live.iter().min_by_key(|n| n.block_count).map(|n| n.id.clone())
    }

    fn place_replica(
        &self,
        live: &[NodeInfo],
        _primary: &NodeId,
        holders: &[NodeId],
        _k: u32,
    ) -> Option<NodeId> {
        live.iter()
            .filter(|n| !holders.contains(&n.id))
            .min_by_key(|n| n.block_count)
            .or_else(|| live.iter().min_by_key(|n| n.block_count))
            .map(|n| n.id.clone())
    }
}

#[derive(Debug, Default)]
pub struct Random;

impl PlacementStrategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn place_primary(&self, live: &[NodeInfo]) -> Option<NodeId> {
        live.choose(&mut rand::thread_rng()).map(|n| n.id.clone())
    }

    fn place_replica(
        &self,
        live: &[NodeInfo],
        _primary: &NodeId,
        holders: &[NodeId],
        _k: u32,
    ) -> Option<NodeId> {
        let free: Vec<&NodeInfo> = live.iter().filter(|n| !holders.contains(&n.id)).collect();
        let mut rng = rand::thread_rng();
        match free.choose(&mut rng) {
            Some(node) => Some(node.id.clone()),
            None => live.choose(&mut rng).map(|n| n.id.clone()),
        }
    }
}

fn first_free_from(live: &[NodeInfo], start: usize, holders: &[NodeId]) -> Option<NodeId> {
    let n = live.len();
    (0..n)
        .map(|i| &live[(start + i) % n])
        .find(|node| !holders.contains(&node.id))
        .or_else(|| live.get(start % n))
        .map(|node| node.id.clone())
}
