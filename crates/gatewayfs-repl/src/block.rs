//! File blocks in the key-value cloud store and the timestamps used to pick
//! a winner when two gateways wrote the same block.
//!
//! Every block blob starts with a 10-byte header: the write timestamp as a
//! big-endian `u64` followed by the writer's big-endian gateway id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ReplError, ReplResult};
use crate::types::{GatewayId, ObjectId};

/// Length of the block header.
pub const BLOCK_HEADER_LEN: usize = 10;

/// Key-value facade over the cloud block store.
pub trait KvsFacade: Send + Sync {
    /// Stores `value` under `key`.
    fn put(&self, key: &str, value: &[u8]) -> ReplResult<()>;

    /// Loads the value under `key`, if any.
    fn get(&self, key: &str) -> ReplResult<Option<Vec<u8>>>;

    /// Removes `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> ReplResult<()>;
}

/// In-memory [`KvsFacade`].
#[derive(Debug, Default)]
pub struct MemoryKvs {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvs {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// True when no blob is stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl KvsFacade for MemoryKvs {
    fn put(&self, key: &str, value: &[u8]) -> ReplResult<()> {
        self.blobs.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> ReplResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> ReplResult<()> {
        self.blobs.write().remove(key);
        Ok(())
    }
}

/// Version of one block as recorded in a file's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVersion {
    /// Monotonic per-block version; 0 means never written.
    pub version: u64,
    /// Gateway that wrote this version.
    pub gateway: GatewayId,
}

impl BlockVersion {
    /// A block that was never written.
    pub const HOLE: BlockVersion = BlockVersion {
        version: 0,
        gateway: GatewayId::NONE,
    };

    /// True for a never-written block.
    pub fn is_hole(&self) -> bool {
        self.version == 0
    }
}

/// Names one stored version of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    /// File the block belongs to.
    pub file: ObjectId,
    /// Block index within the file.
    pub index: u64,
    /// Block version.
    pub version: BlockVersion,
}

impl BlockRef {
    /// Key of the blob in the cloud store.
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}-{:04x}",
            self.file.key(),
            self.index,
            self.version.version,
            self.version.gateway.0
        )
    }
}

/// Header of a block blob. Ordered by timestamp, then gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockStamp {
    /// Write timestamp (ms).
    pub timestamp: u64,
    /// Writer.
    pub gateway: GatewayId,
}

impl BlockStamp {
    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        buf[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..].copy_from_slice(&self.gateway.0.to_be_bytes());
        buf
    }

    /// Parses the header at the start of `blob`.
    pub fn from_bytes(blob: &[u8]) -> Option<Self> {
        if blob.len() < BLOCK_HEADER_LEN {
            return None;
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&blob[..8]);
        Some(Self {
            timestamp: u64::from_be_bytes(ts),
            gateway: GatewayId(u16::from_be_bytes([blob[8], blob[9]])),
        })
    }
}

/// Which side of a block conflict is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// Keep the local block.
    Local,
    /// Adopt the remote block.
    Remote,
}

/// The newer write wins; equal timestamps go to the larger gateway id, so
/// every gateway reaches the same decision.
pub fn pick_winner(local: BlockStamp, remote: BlockStamp) -> Winner {
    if local.timestamp < remote.timestamp
        || (local.timestamp == remote.timestamp && local.gateway < remote.gateway)
    {
        Winner::Remote
    } else {
        Winner::Local
    }
}

/// Loads block headers from the cloud store on demand.
#[derive(Clone)]
pub struct BlockLoader {
    kvs: Arc<dyn KvsFacade>,
}

impl BlockLoader {
    /// Creates a loader over `kvs`.
    pub fn new(kvs: Arc<dyn KvsFacade>) -> Self {
        Self { kvs }
    }

    /// Writes a block blob with its header.
    pub fn store(&self, block: &BlockRef, stamp: BlockStamp, payload: &[u8]) -> ReplResult<()> {
        let mut blob = Vec::with_capacity(BLOCK_HEADER_LEN + payload.len());
        blob.extend_from_slice(&stamp.to_bytes());
        blob.extend_from_slice(payload);
        self.kvs.put(&block.key(), &blob)
    }

    /// Header of `block`, or `None` if the blob is absent.
    pub fn load_stamp(&self, block: &BlockRef) -> ReplResult<Option<BlockStamp>> {
        let key = block.key();
        let Some(blob) = self.kvs.get(&key)? else {
            return Ok(None);
        };
        BlockStamp::from_bytes(&blob)
            .map(Some)
            .ok_or_else(|| ReplError::CorruptBlock {
                key,
                msg: format!("{} bytes, header needs {}", blob.len(), BLOCK_HEADER_LEN),
            })
    }
}

impl std::fmt::Debug for BlockLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLoader").finish_non_exhaustive()
    }
}
