use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::StorageError;

const BLOCK_MARKER: &str = "_block_";
const REPLICA_MARKER: &str = "_Replica";

/// Identifier of one stored block copy.
///
/// Rendered as `{file}_block_{sequence}` for the primary copy and
/// `{file}_block_{sequence}_Replica` / `{file}_block_{sequence}_Replica{k}` for
/// replica copy `k`. Sequences start at 1. Ordering is by file, then sequence,
/// then replica index, so sorting a file's ids yields upload order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId {
    file: String,
    sequence: u64,
    replica: u32,
}

impl BlockId {
    pub fn primary(file: impl Into<String>, sequence: u64) -> Self {
        Self {
            file: file.into(),
            sequence,
            replica: 0,
        }
    }

    /// Id of replica copy `k` (1-based) of this block.
    pub fn replica(&self, k: u32) -> Self {
        Self {
            file: self.file.clone(),
            sequence: self.sequence,
            replica: k,
        }
    }

    pub fn primary_id(&self) -> Self {
        self.replica(0)
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn replica_index(&self) -> u32 {
        self.replica
    }

    pub fn is_replica(&self) -> bool {
        self.replica > 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.file, BLOCK_MARKER, self.sequence)?;
        match self.replica {
            0 => Ok(()),
            1 => write!(f, "{}", REPLICA_MARKER),
            k => write!(f, "{}{}", REPLICA_MARKER, k),
        }
    }
}

impl FromStr for BlockId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::InvalidBlockId(s.to_string());

        let marker = s.rfind(BLOCK_MARKER).ok_or_else(invalid)?;
        let file = &s[..marker];
        if file.is_empty() {
            return Err(invalid());
        }

        let rest = &s[marker + BLOCK_MARKER.len()..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let sequence: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        if sequence == 0 {
            return Err(invalid());
        }

        let replica = match &rest[digits..] {
            "" => 0,
            suffix => {
                let count = suffix.strip_prefix(REPLICA_MARKER).ok_or_else(invalid)?;
                if count.is_empty() {
                    1
                } else {
                    match count.parse::<u32>() {
                        Ok(k) if k >= 2 => k,
                        _ => return Err(invalid()),
                    }
                }
            }
        };

        Ok(Self {
            file: file.to_string(),
            sequence,
            replica,
        })
    }
}

impl TryFrom<String> for BlockId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlockId> for String {
    fn from(id: BlockId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub sha256: String,
    pub blake3: String,
}

impl Checksum {
    pub fn compute(data: &[u8]) -> Self {
        let mut sha256_hasher = Sha256::new();
        sha256_hasher.update(data);
        let sha256 = format!("{:x}", sha256_hasher.finalize());

        let blake3 = blake3::hash(data).to_hex().to_string();

        Self { sha256, blake3 }
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }

    /// Short content digest recorded in manifests.
    pub fn digest(data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }
}

/// Sidecar record written next to every stored block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: String,
    pub size: u64,
    pub checksum: Checksum,
    pub written_at: DateTime<Utc>,
}

impl BlockMeta {
    pub fn new(id: &str, data: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            size: data.len() as u64,
            checksum: Checksum::compute(data),
            written_at: Utc::now(),
        }
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        self.size == data.len() as u64 && self.checksum.matches(data)
    }
}

/// Splits a file payload into `ceil(len / chunk_size)` blocks in sequence order.
///
/// The slices share the original buffer. An empty payload yields no blocks.
pub fn partition(file_name: &str, data: &Bytes, chunk_size: usize) -> Vec<(BlockId, Bytes)> {
    assert!(chunk_size > 0, "chunk size must be positive");

    (0..data.len())
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, start)| {
            let end = (start + chunk_size).min(data.len());
            (
                BlockId::primary(file_name, index as u64 + 1),
                data.slice(start..end),
            )
        })
        .collect()
}
