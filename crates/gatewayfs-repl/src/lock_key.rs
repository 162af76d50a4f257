//! Lock keys: the objects a remote operation touches.
//!
//! Two messages sharing a key are processed in arrival order; messages with
//! disjoint keys may run in parallel.

use std::cmp::Ordering;

use crate::message::{GatewayMessage, GatewayOp};
use crate::types::ObjectId;

/// `(volume, object)` pair ordering dependent remote operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    /// Volume of the object.
    pub volume: String,
    /// The object.
    pub oid: ObjectId,
}

impl LockKey {
    /// Creates a key.
    pub fn new(volume: impl Into<String>, oid: ObjectId) -> Self {
        Self {
            volume: volume.into(),
            oid,
        }
    }

    /// Keys of every object `msg` touches, sorted and without duplicates.
    /// Control messages have none.
    pub fn for_message(msg: &GatewayMessage) -> Vec<LockKey> {
        let oids: Vec<ObjectId> = match &msg.op {
            // Everything created inside a volume hangs off its root.
            GatewayOp::CreateVolume(cv) => vec![cv.root],
            GatewayOp::CreateDir(cd) => vec![cd.parent, cd.oid],
            GatewayOp::CreateFile(cf) => vec![cf.parent, cf.oid],
            GatewayOp::RemoveDir(rd) => vec![rd.parent, rd.oid],
            GatewayOp::UnlinkFile(uf) => vec![uf.parent, uf.oid],
            GatewayOp::Rename(rn) => vec![rn.dst_dir, rn.src_dir, rn.src_oid],
            GatewayOp::SetAttributes(sa) => vec![sa.oid],
            GatewayOp::UpdateFile(uf) => vec![uf.file],
            GatewayOp::Commit
            | GatewayOp::ClaimMaster
            | GatewayOp::AckMaster
            | GatewayOp::RenounceMaster
            | GatewayOp::RemoveVolume => Vec::new(),
        };
        let mut keys: Vec<LockKey> = oids
            .into_iter()
            .map(|oid| LockKey::new(msg.volume.clone(), oid))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

impl Ord for LockKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.oid
            .cmp(&other.oid)
            .then_with(|| self.volume.cmp(&other.volume))
    }
}

impl PartialOrd for LockKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
