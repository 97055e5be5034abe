use async_trait::async_trait;
use network::{HeartbeatOutcome, Request, RequestHandler, Response, Server, TcpClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storage::{BlockStore, StorageError};
use tokio::sync::watch;

use crate::config::NodeConfig;
use crate::error::{BlockFsError, Result};

const MAX_REGISTRATION_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Unregistered,
    Registered,
    Serving,
    Terminated,
}

/// A storage node: block endpoint, registration and heartbeats.
pub struct StorageNode {
    config: NodeConfig,
    host: String,
    port: u16,
    store: Arc<BlockStore>,
    client: TcpClient,
    phase: watch::Sender<NodePhase>,
}

impl StorageNode {
    /// Opens the block store and binds the block endpoint.
    pub async fn bind(config: NodeConfig) -> Result<(Arc<Self>, Server)> {
        config.validate()?;
        let (host, _) = config.listen_host_port()?;

        let store = Arc::new(BlockStore::open(&config.data_dir).await?);
        let server = Server::bind(&config.listen_addr, config.network.clone()).await?;
        let port = server.local_addr()?.port();

        tracing::info!(
            "Storage node {}:{} storing blocks under {:?}",
            host,
            port,
            config.data_dir
        );

        let (phase, _) = watch::channel(NodePhase::Unregistered);
        let node = Arc::new(Self {
            client: TcpClient::new(config.network.clone()),
            config,
            host,
            port,
            store,
            phase,
        });

        Ok((node, server))
    }

    /// `host:port` as registered with the controller.
    pub fn node_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn phase(&self) -> NodePhase {
        *self.phase.borrow()
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn terminate(&self) {
        let previous = self.phase.send_replace(NodePhase::Terminated);
        if previous != NodePhase::Terminated {
            tracing::info!("Storage node {} terminating", self.node_id());
        }
    }

    /// Serves blocks, registers with the controller and then keeps
    /// heartbeating until [`terminate`](Self::terminate) is called.
    pub async fn run(self: Arc<Self>, server: Server) -> Result<()> {
        let mut server_task = tokio::spawn(server.serve(self.clone()));

        if let Err(e) = self.register().await {
            server_task.abort();
            self.terminate();
            return Err(e);
        }
        self.phase.send_replace(NodePhase::Serving);

        let mut heartbeat_task = tokio::spawn(self.clone().heartbeat_loop());
        let mut stats_task = {
            let store = self.store.clone();
            let every = Duration::from_millis(self.config.stats_interval_ms.max(1));
            tokio::spawn(async move { store.run_stats_loop(every).await })
        };

        let mut phase = self.phase.subscribe();

        let outcome = tokio::select! {
            result = &mut server_task => {
                tracing::error!("Block endpoint stopped: {:?}", result);
                Err(BlockFsError::TaskFailed("block endpoint stopped".to_string()))
            }
            result = &mut heartbeat_task => {
                tracing::error!("Heartbeat task stopped: {:?}", result);
                Err(BlockFsError::TaskFailed("heartbeat task stopped".to_string()))
            }
            result = &mut stats_task => {
                tracing::error!("Stats task stopped: {:?}", result);
                Err(BlockFsError::TaskFailed("stats task stopped".to_string()))
            }
            _ = phase.wait_for(|p| *p == NodePhase::Terminated) => Ok(()),
        };

        server_task.abort();
        heartbeat_task.abort();
        stats_task.abort();
        self.terminate();

        outcome
    }

    /// Registers with the controller, retrying with exponential backoff.
    pub async fn register(&self) -> Result<()> {
        let mut backoff = Duration::from_millis(self.config.registration_backoff_ms);
        let attempts = self.config.registration_attempts;

        for attempt in 1..=attempts {
            match self
                .client
                .register(&self.config.controller_addr, &self.host, self.port)
                .await
            {
                Ok(()) => {
                    // Re-registration while serving keeps the node serving.
                    self.phase.send_if_modified(|phase| {
                        let first = *phase == NodePhase::Unregistered;
                        if first {
                            *phase = NodePhase::Registered;
                        }
                        first
                    });
                    tracing::info!(
                        "Registered {} with controller {}",
                        self.node_id(),
                        self.config.controller_addr
                    );
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Registration attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        attempts,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_REGISTRATION_BACKOFF);
                }
                Err(e) => {
                    tracing::error!("Giving up on registration after {} attempts", attempts);
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        interval.tick().await;

        loop {
            interval.tick().await;

            match self
                .client
                .announce(&self.config.controller_addr, &self.node_id())
                .await
            {
                Ok(HeartbeatOutcome::Acknowledged) => {
                    tracing::debug!("Heartbeat acknowledged by {}", self.config.controller_addr)
                }
                Ok(HeartbeatOutcome::UnknownNode) => {
                    tracing::warn!("Controller does not know {}, registering again", self.node_id());
                    if let Err(e) = self.register().await {
                        tracing::error!("Re-registration failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Heartbeat to {} failed: {}", self.config.controller_addr, e),
            }
        }
    }
}

#[async_trait]
impl RequestHandler for StorageNode {
    async fn handle(&self, peer: SocketAddr, request: Request) -> Response {
        match request {
            Request::Heartbeat => Response::HeartbeatAck,
            Request::UploadBlock { block_id, data } => {
                match self.store.write_block(&block_id, data).await {
                    Ok(meta) => {
                        tracing::debug!("Stored {} ({} bytes) from {}", block_id, meta.size, peer);
                        Response::UploadBlockSuccess
                    }
                    Err(e) => {
                        tracing::error!("Failed to store {}: {}", block_id, e);
                        Response::UploadBlockError(e.to_string())
                    }
                }
            }
            Request::DownloadBlock { block_id } => match self.store.read_block(&block_id).await {
                Ok(data) => Response::BlockData(data),
                Err(StorageError::BlockNotFound(_)) => {
                    tracing::warn!("Block {} not found", block_id);
                    Response::BlockNotFound(block_id)
                }
                Err(e) => {
                    tracing::error!("Failed to read {}: {}", block_id, e);
                    Response::DownloadBlockError(e.to_string())
                }
            },
            Request::DeleteBlock { block_id } => match self.store.delete_block(&block_id).await {
                Ok(()) => Response::DeleteBlockSuccess,
                Err(StorageError::BlockNotFound(_)) => Response::BlockNotFound(block_id),
                Err(e) => {
                    tracing::error!("Failed to delete {}: {}", block_id, e);
                    Response::Error(e.to_string())
                }
            },
            other => {
                tracing::warn!("{} from {} sent to a storage node", other.command(), peer);
                Response::Error(format!("{} is served by the controller", other.command()))
            }
        }
    }
}
