use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::{Config, NetworkError, Result};

/// Block traffic between the controller and storage nodes.
///
/// `node` is the node id, which doubles as its `host:port` address.
#[async_trait]
pub trait BlockTransport: Send + Sync {
    async fn write_block(&self, node: &str, block_id: &str, data: Bytes) -> Result<()>;

    /// `Ok(None)` when the node answers that it does not hold the block.
    async fn read_block(&self, node: &str, block_id: &str) -> Result<Option<Bytes>>;

    /// `Ok(false)` when the node did not hold the block.
    async fn delete_block(&self, node: &str, block_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Acknowledged,
    /// The controller has no record of this node and expects a new registration.
    UnknownNode,
}

/// One-request-per-connection TCP client with connect, read and write timeouts.
#[derive(Debug, Clone, Default)]
pub struct TcpClient {
    config: Config,
}

impl TcpClient {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn request(&self, addr: &str, request: &Request) -> Result<Response> {
        let payload = request.encode()?;

        let mut stream = timeout(self.config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        tracing::trace!("Sending {} to {}", request.command(), addr);

        timeout(self.config.write_timeout(), write_frame(&mut stream, &payload))
            .await
            .map_err(|_| NetworkError::Timeout(format!("writing to {}", addr)))??;

        let frame = timeout(
            self.config.read_timeout(),
            read_frame(&mut stream, self.config.max_frame_bytes),
        )
        .await
        .map_err(|_| NetworkError::Timeout(format!("reading from {}", addr)))??;

        Ok(Response::decode(frame)?)
    }

    pub async fn register(&self, controller: &str, host: &str, port: u16) -> Result<()> {
        let request = Request::Register {
            host: host.to_string(),
            port,
        };

        match self.request(controller, &request).await? {
            Response::RegistrationSuccess => Ok(()),
            Response::RegistrationError(reason) | Response::Error(reason) => {
                Err(NetworkError::Remote(reason))
            }
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn announce(&self, controller: &str, node_id: &str) -> Result<HeartbeatOutcome> {
        let request = Request::Announce {
            node_id: node_id.to_string(),
        };

        match self.request(controller, &request).await? {
            Response::HeartbeatAck => Ok(HeartbeatOutcome::Acknowledged),
            Response::UnknownNode => Ok(HeartbeatOutcome::UnknownNode),
            Response::Error(reason) => Err(NetworkError::Remote(reason)),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn ping(&self, node: &str) -> Result<()> {
        match self.request(node, &Request::Heartbeat).await? {
            Response::HeartbeatAck => Ok(()),
            other => Err(unexpected(&Request::Heartbeat, &other)),
        }
    }
}

#[async_trait]
impl BlockTransport for TcpClient {
    async fn write_block(&self, node: &str, block_id: &str, data: Bytes) -> Result<()> {
        let request = Request::UploadBlock {
            block_id: block_id.to_string(),
            data,
        };

        match self.request(node, &request).await? {
            Response::UploadBlockSuccess => Ok(()),
            Response::UploadBlockError(reason) | Response::Error(reason) => {
                Err(NetworkError::Remote(reason))
            }
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn read_block(&self, node: &str, block_id: &str) -> Result<Option<Bytes>> {
        let request = Request::DownloadBlock {
            block_id: block_id.to_string(),
        };

        match self.request(node, &request).await? {
            Response::BlockData(data) => Ok(Some(data)),
            Response::BlockNotFound(_) => Ok(None),
            Response::DownloadBlockError(reason) | Response::Error(reason) => {
                Err(NetworkError::Remote(reason))
            }
            other => Err(unexpected(&request, &other)),
        }
    }

    async fn delete_block(&self, node: &str, block_id: &str) -> Result<bool> {
        let request = Request::DeleteBlock {
            block_id: block_id.to_string(),
        };

        match self.request(node, &request).await? {
            Response::DeleteBlockSuccess => Ok(true),
            Response::BlockNotFound(_) => Ok(false),
            Response::Error(reason) => Err(NetworkError::Remote(reason)),
            other => Err(unexpected(&request, &other)),
        }
    }
}

fn unexpected(request: &Request, response: &Response) -> NetworkError {
    NetworkError::UnexpectedResponse(format!("{:?} in reply to {}", response, request.command()))
}
