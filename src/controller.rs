use async_trait::async_trait;
use bytes::Bytes;
use cluster::{
    FailureDetector, NodeId, NodeInfo, NodeRegistry, NodeStatus, PlacementStrategy, StatusChange,
};
use network::{BlockTransport, Request, RequestHandler, Response, Server, TcpClient};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use storage::{BlockId, MetadataDocument, MetadataStore};
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::ControllerConfig;
use crate::error::{BlockFsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Listening,
    AwaitingQuorum,
    Operational,
    ShuttingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Listening => "listening",
            Phase::AwaitingQuorum => "awaiting-quorum",
            Phase::Operational => "operational",
            Phase::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

/// Coordinator state shared by the request handler, the operator surfaces and
/// the background tasks.
///
/// The metadata document lock is held for a whole upload, repair or purge, so
/// those never interleave.
pub struct Controller {
    pub(crate) config: ControllerConfig,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) metadata: Mutex<MetadataDocument>,
    pub(crate) store: MetadataStore,
    pub(crate) transport: Arc<dyn BlockTransport>,
    pub(crate) placement: Box<dyn PlacementStrategy>,
    phase: watch::Sender<Phase>,
}

impl Controller {
    /// Builds a controller talking to storage nodes over TCP.
    pub async fn new(config: ControllerConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(TcpClient::new(config.network.clone()));
        Self::with_transport(config, transport).await
    }

    pub async fn with_transport(
        config: ControllerConfig,
        transport: Arc<dyn BlockTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let store = MetadataStore::new(&config.metadata_path);
        let document = store.load().await?;
        let placement = config.placement.build();
        let primaries = document
            .placements
            .keys()
            .filter_map(|id| id.parse::<BlockId>().ok())
            .filter(|id| !id.is_replica())
            .count();
        placement.resume(primaries, document.placements.len());

        tracing::info!(
            "Controller configured: quorum {}, chunk size {}, replication factor {}, placement {}",
            config.quorum,
            config.chunk_size,
            config.replication_factor,
            placement.name()
        );

        let (phase, _) = watch::channel(Phase::Listening);

        Ok(Arc::new(Self {
            registry: Arc::new(NodeRegistry::new(config.quorum)),
            metadata: Mutex::new(document),
            store,
            transport,
            placement,
            phase,
            config,
        }))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Runs the control endpoint, the failure detector and the dead-node
    /// handler until shutdown is requested.
    pub async fn serve(self: Arc<Self>, server: Server) -> Result<()> {
        let addr = server.local_addr()?;
        self.advance(Phase::Listening, Phase::AwaitingQuorum);
        if self.registry.has_quorum() {
            self.advance(Phase::AwaitingQuorum, Phase::Operational);
        }
        tracing::info!("Controller listening on {}", addr);

        let (detector, changes) =
            FailureDetector::new(self.registry.clone(), self.config.clone().into());

        let mut server_task = tokio::spawn(server.serve(self.clone()));
        let mut detector_task = tokio::spawn(detector.run());
        let mut status_task = {
            let controller = self.clone();
            tokio::spawn(async move { controller.handle_status_changes(changes).await })
        };

        let mut phase = self.subscribe_phase();

        let outcome = tokio::select! {
            result = &mut server_task => {
                tracing::error!("Control endpoint stopped: {:?}", result);
                Err(BlockFsError::TaskFailed("control endpoint stopped".to_string()))
            }
            result = &mut detector_task => {
                tracing::error!("Failure detector stopped: {:?}", result);
                Err(BlockFsError::TaskFailed("failure detector stopped".to_string()))
            }
            result = &mut status_task => {
                tracing::error!("Status change handler stopped: {:?}", result);
                Ok(())
            }
            _ = phase.wait_for(|p| *p == Phase::ShuttingDown) => {
                tracing::info!("Controller stopping");
                Ok(())
            }
        };

        server_task.abort();
        detector_task.abort();
        status_task.abort();

        outcome
    }

    /// Rejects operator operations until quorum is reached or after shutdown began.
    pub fn ensure_operational(&self) -> Result<()> {
        if self.phase() == Phase::ShuttingDown {
            return Err(BlockFsError::ShuttingDown);
        }
        if !self.registry.has_quorum() {
            return Err(BlockFsError::QuorumNotReached {
                registered: self.registry.registered_count(),
                required: self.registry.quorum(),
            });
        }
        Ok(())
    }

    pub async fn status(&self) -> api::ClusterStatus {
        let files = self.metadata.lock().await.manifests.len();

        api::ClusterStatus {
            phase: self.phase().to_string(),
            registered_nodes: self.registry.registered_count(),
            required_nodes: self.registry.quorum(),
            registrations: self.registry.registrations().await,
            placement: self.placement.name().to_string(),
            replication_factor: self.config.replication_factor,
            nodes: self.registry.nodes().await,
            files,
        }
    }

    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.registry.nodes().await
    }

    /// Stops operator operations. With `purge`, every placed block copy is
    /// deleted from its node (best effort) and the metadata is cleared.
    ///
    /// Waits for an in-flight upload or repair to finish first.
    pub async fn shutdown(&self, purge: bool) -> Result<()> {
        let mut document = self.metadata.lock().await;

        let previous = self.phase.send_replace(Phase::ShuttingDown);
        if previous == Phase::ShuttingDown {
            return Ok(());
        }
        tracing::info!("Shutting down controller (purge: {})", purge);

        if purge {
            self.purge(&mut document).await?;
        }

        Ok(())
    }

    /// Resolves once no upload, repair or purge holds the metadata.
    pub async fn wait_idle(&self) {
        drop(self.metadata.lock().await);
    }

    async fn purge(&self, document: &mut MetadataDocument) -> Result<()> {
        let mut deleted = 0usize;
        let mut failed = 0usize;
        for (block_id, node) in &document.placements {
            match self.transport.delete_block(node, block_id).await {
                Ok(true) => deleted += 1,
                Ok(false) => tracing::debug!("Block {} already absent on {}", block_id, node),
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Failed to delete block {} on {}: {}", block_id, node, e);
                }
            }
        }

        *document = MetadataDocument::default();
        self.store.clear().await?;
        self.registry.set_block_counts(std::iter::empty()).await;

        tracing::info!(
            "Purged {} block copies ({} deletions failed), metadata cleared",
            deleted,
            failed
        );
        Ok(())
    }

    fn advance(&self, from: Phase, to: Phase) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("Controller phase: {} -> {}", from, to);
        }
    }

    async fn on_register(&self, host: String, port: u16) -> Response {
        match self.registry.register(&host, port).await {
            Ok(id) => {
                if let Ok(document) = self.metadata.try_lock() {
                    self.registry
                        .set_block_counts(document.placements.values().map(String::as_str))
                        .await;
                }

                if self.registry.has_quorum() {
                    self.advance(Phase::AwaitingQuorum, Phase::Operational);
                }

                tracing::info!(
                    "Storage node {} registered ({}/{} nodes)",
                    id,
                    self.registry.registered_count(),
                    self.registry.quorum()
                );
                Response::RegistrationSuccess
            }
            Err(e) => {
                tracing::warn!("Rejected registration of {}:{}: {}", host, port, e);
                Response::RegistrationError(e.to_string())
            }
        }
    }

    async fn on_announce(&self, node_id: String) -> Response {
        let id = NodeId(node_id);
        match self.registry.record_heartbeat(&id).await {
            Ok(_) => {
                tracing::debug!("Heartbeat from {}", id);
                Response::HeartbeatAck
            }
            Err(_) => {
                tracing::warn!("Heartbeat from unregistered node {}", id);
                Response::UnknownNode
            }
        }
    }

    async fn handle_status_changes(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<StatusChange>) {
        while let Some(change) = changes.recv().await {
            if change.to != NodeStatus::Dead || !self.config.re_replicate {
                continue;
            }
            if self.phase() == Phase::ShuttingDown {
                continue;
            }

            match self.repair_node(&change.node).await {
                Ok(repaired) => tracing::info!(
                    "Re-replicated {} block copies away from dead node {}",
                    repaired,
                    change.node
                ),
                Err(e) => tracing::error!("Re-replication for {} failed: {}", change.node, e),
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Controller {
    async fn handle(&self, peer: SocketAddr, request: Request) -> Response {
        match request {
            Request::Register { host, port } => self.on_register(host, port).await,
            Request::Announce { node_id } => self.on_announce(node_id).await,
            Request::Heartbeat => Response::HeartbeatAck,
            other => {
                tracing::warn!("{} from {} sent to the controller", other.command(), peer);
                Response::Error(format!("{} is served by storage nodes", other.command()))
            }
        }
    }
}

#[async_trait]
impl api::FileService for Controller {
    async fn status(&self) -> api::ClusterStatus {
        Controller::status(self).await
    }

    async fn nodes(&self) -> Vec<NodeInfo> {
        Controller::nodes(self).await
    }

    async fn files(&self) -> Vec<api::FileSummary> {
        self.list_files().await
    }

    async fn upload(&self, name: &str, data: Bytes) -> api::ApiResult<api::UploadSummary> {
        let report = self.upload_bytes(name, data).await?;
        Ok(report.summary())
    }

    async fn download(&self, name: &str) -> api::ApiResult<Bytes> {
        Ok(self.download_bytes(name).await?)
    }

    async fn shutdown(&self) -> api::ApiResult<()> {
        Ok(Controller::shutdown(self, self.config.purge_on_exit).await?)
    }
}
