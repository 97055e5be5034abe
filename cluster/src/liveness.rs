use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::registry::{NodeRegistry, StatusChange};
use crate::{Config, NodeStatus};

/// Periodic heartbeat sweep over the registry.
///
/// Every transition is logged and forwarded on the channel so the controller
/// can react to nodes going dead.
pub struct FailureDetector {
    registry: Arc<NodeRegistry>,
    config: Config,
    changes: mpsc::UnboundedSender<StatusChange>,
}

impl FailureDetector {
    pub fn new(
        registry: Arc<NodeRegistry>,
        config: Config,
    ) -> (Self, mpsc::UnboundedReceiver<StatusChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let detector = Self {
            registry,
            config,
            changes: tx,
        };
        (detector, rx)
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());

        tracing::info!(
            "Failure detector running every {:?} (suspect after {}, dead after {} missed)",
            self.config.heartbeat_interval(),
            self.config.suspect_after_missed,
            self.config.dead_after_missed
        );

        loop {
            interval.tick().await;

            for change in self.check_once().await {
                if self.changes.send(change).is_err() {
                    tracing::debug!("Status change receiver dropped");
                }
            }
        }
    }

    pub async fn check_once(&self) -> Vec<StatusChange> {
        let changes = self.registry.sweep(Utc::now(), &self.config).await;

        for change in &changes {
            match change.to {
                NodeStatus::Dead => tracing::error!("Node {} is dead (was {})", change.node, change.from),
                _ => tracing::warn!("Node {} is {} (was {})", change.node, change.to, change.from),
            }
        }

        changes
    }
}
