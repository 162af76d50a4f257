//! Gateway messages exchanged between replicas, and the inbound filter.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ReplResult;
use crate::types::{GatewayId, ObjectAttributes, ObjectId};

/// Creates a volume and its root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolume {
    /// Root directory of the new volume.
    pub root: ObjectId,
    /// Root directory attributes.
    pub attrs: ObjectAttributes,
}

/// Creates a directory under `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDir {
    /// Parent directory.
    pub parent: ObjectId,
    /// New directory.
    pub oid: ObjectId,
    /// Name in the parent.
    pub name: String,
    /// Initial attributes.
    pub attrs: ObjectAttributes,
}

/// Creates an empty file under `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFile {
    /// Parent directory.
    pub parent: ObjectId,
    /// New file.
    pub oid: ObjectId,
    /// Name in the parent.
    pub name: String,
    /// Initial attributes.
    pub attrs: ObjectAttributes,
    /// Block size of the file.
    pub block_size: u32,
}

/// A write covering `[offset, offset + length)`, carrying one new block
/// version per block in the range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFile {
    /// File written.
    pub file: ObjectId,
    /// Byte offset of the write.
    pub offset: u64,
    /// Byte length of the write.
    pub length: u64,
    /// Versions of the written blocks, in block order.
    pub new_versions: Vec<u64>,
    /// File attributes after the write on the remote gateway.
    pub new_attrs: ObjectAttributes,
}

/// Removes file `oid` named `name` from `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkFile {
    /// Parent directory.
    pub parent: ObjectId,
    /// Name in the parent.
    pub name: String,
    /// File expected under the name.
    pub oid: ObjectId,
}

/// Removes directory `oid` named `name` from `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDir {
    /// Parent directory.
    pub parent: ObjectId,
    /// Name in the parent.
    pub name: String,
    /// Directory expected under the name.
    pub oid: ObjectId,
}

/// Moves `src_oid` from `src_dir/src_name` to `dst_dir/dst_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rename {
    /// Source directory.
    pub src_dir: ObjectId,
    /// Name in the source directory.
    pub src_name: String,
    /// Object being moved.
    pub src_oid: ObjectId,
    /// Destination directory.
    pub dst_dir: ObjectId,
    /// Name in the destination directory.
    pub dst_name: String,
}

/// Replaces the attributes of `oid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttributes {
    /// Object changed.
    pub oid: ObjectId,
    /// New attributes.
    pub attrs: ObjectAttributes,
}

/// Operation carried by a [`GatewayMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayOp {
    /// Create a volume.
    CreateVolume(CreateVolume),
    /// Create a directory.
    CreateDir(CreateDir),
    /// Create a file.
    CreateFile(CreateFile),
    /// Write to a file.
    UpdateFile(UpdateFile),
    /// Remove a file.
    UnlinkFile(UnlinkFile),
    /// Remove a directory.
    RemoveDir(RemoveDir),
    /// Move an object.
    Rename(Rename),
    /// Change attributes.
    SetAttributes(SetAttributes),
    /// End of a remote batch.
    Commit,
    /// Mastership election: claim.
    ClaimMaster,
    /// Mastership election: acknowledgement.
    AckMaster,
    /// Mastership election: renunciation.
    RenounceMaster,
    /// Remove a volume.
    RemoveVolume,
}

impl GatewayOp {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayOp::CreateVolume(_) => "CreateVolume",
            GatewayOp::CreateDir(_) => "CreateDir",
            GatewayOp::CreateFile(_) => "CreateFile",
            GatewayOp::UpdateFile(_) => "UpdateFile",
            GatewayOp::UnlinkFile(_) => "UnlinkFile",
            GatewayOp::RemoveDir(_) => "RemoveDir",
            GatewayOp::Rename(_) => "Rename",
            GatewayOp::SetAttributes(_) => "SetAttributes",
            GatewayOp::Commit => "Commit",
            GatewayOp::ClaimMaster => "ClaimMaster",
            GatewayOp::AckMaster => "AckMaster",
            GatewayOp::RenounceMaster => "RenounceMaster",
            GatewayOp::RemoveVolume => "RemoveVolume",
        }
    }
}

/// One replicated operation, as published by its origin gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// Sequence number assigned by the origin gateway.
    pub id: u64,
    /// Origin gateway.
    pub gateway: GatewayId,
    /// Volume the operation applies to.
    pub volume: String,
    /// Origin timestamp (ms).
    pub timestamp: u64,
    /// The operation.
    pub op: GatewayOp,
}

impl GatewayMessage {
    /// Serializes the message for transport.
    pub fn encode(&self) -> ReplResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parses a message received from transport.
    pub fn decode(bytes: &[u8]) -> ReplResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Drops inbound messages that must not be replayed locally.
#[derive(Debug, Clone, Copy)]
pub struct GatewayMessageFilter {
    local: GatewayId,
}

impl GatewayMessageFilter {
    /// Creates a filter for the gateway `local`.
    pub fn new(local: GatewayId) -> Self {
        Self { local }
    }

    /// Returns false for malformed messages (source gateway 0) and for
    /// messages this gateway published itself.
    pub fn accept(&self, msg: &GatewayMessage) -> bool {
        if msg.gateway == GatewayId::NONE {
            warn!(id = msg.id, op = msg.op.name(), "dropping message without source gateway");
            return false;
        }
        if msg.gateway == self.local {
            debug!(id = msg.id, op = msg.op.name(), "ignoring message from local gateway");
            return false;
        }
        true
    }
}
