//! Text wire protocol shared by the controller and the storage nodes.
//!
//! Every message travels in one length-prefixed frame (4-byte big-endian
//! length, then the payload) and a connection carries exactly one request and
//! one response. Inside a payload, fields are separated by [`DELIMITER`],
//! except `REGISTER` and `HEARTBEAT_ACK` announcements which use single spaces.
//! Block payloads are always the trailing field, so they may contain the
//! delimiter.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetworkError, Result};

pub const DELIMITER: &str = "?>?";

const REGISTER: &str = "REGISTER";
const HEARTBEAT_ACK: &str = "HEARTBEAT_ACK";
const HEARTBEAT: &str = "HEARTBEAT";
const UPLOAD_BLOCK: &str = "UPLOAD_BLOCK";
const DOWNLOAD_BLOCK: &str = "DOWNLOAD_BLOCK";
const DELETE_BLOCK: &str = "DELETE_BLOCK";

const REGISTRATION_SUCCESS: &str = "REGISTRATION_SUCCESS";
const REGISTRATION_ERROR: &str = "REGISTRATION_ERROR";
const UNKNOWN_NODE: &str = "UNKNOWN_NODE";
const UPLOAD_BLOCK_SUCCESS: &str = "UPLOAD_BLOCK_SUCCESS";
const UPLOAD_BLOCK_ERROR: &str = "UPLOAD_BLOCK_ERROR";
const BLOCK_DATA: &str = "BLOCK_DATA";
const BLOCK_NOT_FOUND: &str = "BLOCK_NOT_FOUND";
const DOWNLOAD_BLOCK_ERROR: &str = "DOWNLOAD_BLOCK_ERROR";
const DELETE_BLOCK_SUCCESS: &str = "DELETE_BLOCK_SUCCESS";
const ERROR: &str = "ERROR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Storage node joining the cluster.
    Register { host: String, port: u16 },
    /// Periodic liveness announcement from a storage node (`HEARTBEAT_ACK host:port`).
    Announce { node_id: String },
    /// Liveness check sent to a storage node.
    Heartbeat,
    UploadBlock { block_id: String, data: Bytes },
    DownloadBlock { block_id: String },
    DeleteBlock { block_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegistrationSuccess,
    RegistrationError(String),
    HeartbeatAck,
    UnknownNode,
    UploadBlockSuccess,
    UploadBlockError(String),
    BlockData(Bytes),
    BlockNotFound(String),
    DownloadBlockError(String),
    DeleteBlockSuccess,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed {command} message: {reason}")]
    Malformed { command: String, reason: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl DecodeError {
    fn malformed(command: &str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    /// The explicit error reply a server sends back for an undecodable request.
    pub fn response(&self) -> Response {
        match self {
            DecodeError::Malformed { command, .. } => match command.as_str() {
                REGISTER => Response::RegistrationError(self.to_string()),
                UPLOAD_BLOCK => Response::UploadBlockError(self.to_string()),
                DOWNLOAD_BLOCK => Response::DownloadBlockError(self.to_string()),
                _ => Response::Error(self.to_string()),
            },
            DecodeError::UnknownCommand(_) => Response::Error(self.to_string()),
        }
    }
}

impl Request {
    pub fn command(&self) -> &'static str {
        match self {
            Request::Register { .. } => REGISTER,
            Request::Announce { .. } => HEARTBEAT_ACK,
            Request::Heartbeat => HEARTBEAT,
            Request::UploadBlock { .. } => UPLOAD_BLOCK,
            Request::DownloadBlock { .. } => DOWNLOAD_BLOCK,
            Request::DeleteBlock { .. } => DELETE_BLOCK,
        }
    }

    /// Fails when a block id contains [`DELIMITER`]; the receiver would split
    /// it into a different id and payload.
    pub fn encode(&self) -> Result<Bytes> {
        let encoded = match self {
            Request::Register { host, port } => {
                Bytes::from(format!("{} {} {}", REGISTER, host, port))
            }
            Request::Announce { node_id } => Bytes::from(format!("{} {}", HEARTBEAT_ACK, node_id)),
            Request::Heartbeat => Bytes::from_static(HEARTBEAT.as_bytes()),
            Request::UploadBlock { block_id, data } => {
                check_block_id(block_id)?;
                let mut buf = fields(&[UPLOAD_BLOCK, block_id.as_str()], data.len());
                buf.put_slice(DELIMITER.as_bytes());
                buf.put_slice(data);
                buf.freeze()
            }
            Request::DownloadBlock { block_id } => {
                check_block_id(block_id)?;
                fields(&[DOWNLOAD_BLOCK, block_id.as_str()], 0).freeze()
            }
            Request::DeleteBlock { block_id } => {
                check_block_id(block_id)?;
                fields(&[DELETE_BLOCK, block_id.as_str()], 0).freeze()
            }
        };
        Ok(encoded)
    }

    pub fn decode(payload: Bytes) -> std::result::Result<Self, DecodeError> {
        if let Some(rest) = payload.strip_prefix(format!("{} ", REGISTER).as_bytes()) {
            let text = utf8(REGISTER, rest)?;
            let mut parts = text.split_whitespace();
            let host = parts
                .next()
                .ok_or_else(|| DecodeError::malformed(REGISTER, "missing host"))?;
            let port = parts
                .next()
                .ok_or_else(|| DecodeError::malformed(REGISTER, "missing port"))?
                .parse::<u16>()
                .map_err(|e| DecodeError::malformed(REGISTER, format!("invalid port: {}", e)))?;
            return Ok(Request::Register {
                host: host.to_string(),
                port,
            });
        }

        if let Some(rest) = payload.strip_prefix(format!("{} ", HEARTBEAT_ACK).as_bytes()) {
            let node_id = utf8(HEARTBEAT_ACK, rest)?.trim();
            if node_id.is_empty() {
                return Err(DecodeError::malformed(HEARTBEAT_ACK, "missing node id"));
            }
            return Ok(Request::Announce {
                node_id: node_id.to_string(),
            });
        }

        let (command, rest) = split_field(&payload);
        let command = utf8("request", &command)?.trim().to_string();

        match command.as_str() {
            HEARTBEAT => Ok(Request::Heartbeat),
            UPLOAD_BLOCK => {
                let rest = rest.ok_or_else(|| DecodeError::malformed(UPLOAD_BLOCK, "missing block id"))?;
                let (block_id, data) = split_field(&rest);
                let data = data.ok_or_else(|| DecodeError::malformed(UPLOAD_BLOCK, "missing block data"))?;
                Ok(Request::UploadBlock {
                    block_id: block_id_field(UPLOAD_BLOCK, &block_id)?,
                    data,
                })
            }
            DOWNLOAD_BLOCK => {
                let rest = rest.ok_or_else(|| DecodeError::malformed(DOWNLOAD_BLOCK, "missing block id"))?;
                Ok(Request::DownloadBlock {
                    block_id: block_id_field(DOWNLOAD_BLOCK, &rest)?,
                })
            }
            DELETE_BLOCK => {
                let rest = rest.ok_or_else(|| DecodeError::malformed(DELETE_BLOCK, "missing block id"))?;
                Ok(Request::DeleteBlock {
                    block_id: block_id_field(DELETE_BLOCK, &rest)?,
                })
            }
            REGISTER => Err(DecodeError::malformed(REGISTER, "missing host and port")),
            HEARTBEAT_ACK => Err(DecodeError::malformed(HEARTBEAT_ACK, "missing node id")),
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }
}

impl Response {
    pub fn encode(&self) -> Bytes {
        match self {
            Response::RegistrationSuccess => Bytes::from_static(REGISTRATION_SUCCESS.as_bytes()),
            Response::RegistrationError(reason) => fields(&[REGISTRATION_ERROR, reason.as_str()], 0).freeze(),
            Response::HeartbeatAck => Bytes::from_static(HEARTBEAT_ACK.as_bytes()),
            Response::UnknownNode => Bytes::from_static(UNKNOWN_NODE.as_bytes()),
            Response::UploadBlockSuccess => Bytes::from_static(UPLOAD_BLOCK_SUCCESS.as_bytes()),
            Response::UploadBlockError(reason) => fields(&[UPLOAD_BLOCK_ERROR, reason.as_str()], 0).freeze(),
            Response::BlockData(data) => {
                let mut buf = fields(&[BLOCK_DATA], data.len());
                buf.put_slice(DELIMITER.as_bytes());
                buf.put_slice(data);
                buf.freeze()
            }
            Response::BlockNotFound(block_id) => fields(&[BLOCK_NOT_FOUND, block_id.as_str()], 0).freeze(),
            Response::DownloadBlockError(reason) => {
                fields(&[DOWNLOAD_BLOCK_ERROR, reason.as_str()], 0).freeze()
            }
            Response::DeleteBlockSuccess => Bytes::from_static(DELETE_BLOCK_SUCCESS.as_bytes()),
            Response::Error(reason) => fields(&[ERROR, reason.as_str()], 0).freeze(),
        }
    }

    pub fn decode(payload: Bytes) -> std::result::Result<Self, DecodeError> {
        let (status, rest) = split_field(&payload);
        let status = utf8("response", &status)?.trim().to_string();
        let text = |rest: Option<Bytes>| -> std::result::Result<String, DecodeError> {
            match rest {
                Some(rest) => Ok(utf8(&status, &rest)?.to_string()),
                None => Ok(String::new()),
            }
        };

        match status.as_str() {
            REGISTRATION_SUCCESS => Ok(Response::RegistrationSuccess),
            REGISTRATION_ERROR => Ok(Response::RegistrationError(text(rest)?)),
            HEARTBEAT_ACK => Ok(Response::HeartbeatAck),
            UNKNOWN_NODE => Ok(Response::UnknownNode),
            UPLOAD_BLOCK_SUCCESS => Ok(Response::UploadBlockSuccess),
            UPLOAD_BLOCK_ERROR => Ok(Response::UploadBlockError(text(rest)?)),
            BLOCK_DATA => Ok(Response::BlockData(rest.unwrap_or_default())),
            BLOCK_NOT_FOUND => Ok(Response::BlockNotFound(text(rest)?)),
            DOWNLOAD_BLOCK_ERROR => Ok(Response::DownloadBlockError(text(rest)?)),
            DELETE_BLOCK_SUCCESS => Ok(Response::DeleteBlockSuccess),
            ERROR => Ok(Response::Error(text(rest)?)),
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| NetworkError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > max_frame_bytes {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn fields(parts: &[&str], extra: usize) -> BytesMut {
    let len = parts.iter().map(|p| p.len() + DELIMITER.len()).sum::<usize>() + extra;
    let mut buf = BytesMut::with_capacity(len);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.put_slice(DELIMITER.as_bytes());
        }
        buf.put_slice(part.as_bytes());
    }
    buf
}

/// Splits off the first field; the remainder (after one delimiter) is returned untouched.
fn split_field(payload: &Bytes) -> (Bytes, Option<Bytes>) {
    let delim = DELIMITER.as_bytes();
    match payload.windows(delim.len()).position(|w| w == delim) {
        Some(at) => (payload.slice(..at), Some(payload.slice(at + delim.len()..))),
        None => (payload.clone(), None),
    }
}

fn check_block_id(block_id: &str) -> Result<()> {
    if block_id.contains(DELIMITER) {
        return Err(NetworkError::InvalidField(format!(
            "block id {:?} contains the field delimiter",
            block_id
        )));
    }
    Ok(())
}

fn utf8<'a>(command: &str, raw: &'a [u8]) -> std::result::Result<&'a str, DecodeError> {
    std::str::from_utf8(raw).map_err(|_| DecodeError::malformed(command, "field is not valid UTF-8"))
}

fn block_id_field(command: &str, raw: &[u8]) -> std::result::Result<String, DecodeError> {
    let block_id = utf8(command, raw)?;
    if block_id.is_empty() {
        return Err(DecodeError::malformed(command, "empty block id"));
    }
    Ok(block_id.to_string())
}
