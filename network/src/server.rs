use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::{Config, NetworkError, Result};

/// Answers one decoded request. Malformed requests never reach the handler;
/// the server replies to those itself.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, peer: SocketAddr, request: Request) -> Response;
}

/// Framed TCP listener serving one request per connection.
pub struct Server {
    listener: TcpListener,
    config: Config,
}

impl Server {
    pub async fn bind(addr: &str, config: Config) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("bind {}: {}", addr, e)))?;

        tracing::info!("Listening on {}", listener.local_addr()?);

        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the task is dropped; each one is served on its own task.
    pub async fn serve<H: RequestHandler>(self, handler: Arc<H>) -> Result<()> {
        let config = Arc::new(self.config);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let handler = handler.clone();
            let config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, peer, handler, &config).await {
                    tracing::warn!("Connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection<H: RequestHandler>(
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<H>,
        config: &Config,
    ) -> Result<()> {
        let frame = timeout(
            config.read_timeout(),
            read_frame(&mut stream, config.max_frame_bytes),
        )
        .await
        .map_err(|_| NetworkError::Timeout(format!("reading request from {}", peer)))??;

        let response = match Request::decode(frame) {
            Ok(request) => {
                tracing::debug!("{} from {}", request.command(), peer);
                handler.handle(peer, request).await
            }
            Err(e) => {
                tracing::warn!("Rejecting request from {}: {}", peer, e);
                e.response()
            }
        };

        timeout(
            config.write_timeout(),
            write_frame(&mut stream, &response.encode()),
        )
        .await
        .map_err(|_| NetworkError::Timeout(format!("writing response to {}", peer)))??;

        Ok(())
    }
}
