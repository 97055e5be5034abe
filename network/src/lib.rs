mod communication;
mod protocol;
mod server;

pub use communication::{BlockTransport, HeartbeatOutcome, TcpClient};
pub use protocol::{read_frame, write_frame, DecodeError, Request, Response, DELIMITER};
pub use server::{RequestHandler, Server};

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] DecodeError),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Peer reported error: {0}")]
    Remote(String),

    #[error("Invalid message field: {0}")]
    InvalidField(String),
}

/// Timeouts and limits applied to every connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
