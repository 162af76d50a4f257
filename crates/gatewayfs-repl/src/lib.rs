#![warn(missing_docs)]

//! GatewayFS replication subsystem: replays operations published by remote
//! gateways into the local namespace, ordering dependent messages by lock key
//! and resolving conflicts with concurrent local changes

pub mod block;
pub mod conflict;
pub mod error;
pub mod handler;
pub mod lock_key;
pub mod message;
pub mod message_manager;
pub mod namespace;
pub mod types;

#[cfg(test)]
mod test_support;

pub use block::{
    pick_winner, BlockLoader, BlockRef, BlockStamp, BlockVersion, KvsFacade, MemoryKvs, Winner,
};
pub use conflict::{ConflictResolver, ConflictStats, ResolveOutcome};
pub use error::{ReplError, ReplResult};
pub use handler::{FatalHook, GatewayMessageHandler, HandlerConfig, HandlerStats};
pub use lock_key::LockKey;
pub use message::{
    CreateDir, CreateFile, CreateVolume, GatewayMessage, GatewayMessageFilter, GatewayOp,
    RemoveDir, Rename, SetAttributes, UnlinkFile, UpdateFile,
};
pub use message_manager::{GatewayMessageManager, ReleasedMessage};
pub use namespace::{
    CreateOutcome, DirectoryMeta, FileMeta, ObjectNode, RemoveOutcome, Volume, VolumeInfo,
    VolumeRegistry,
};
pub use types::{GatewayId, ObjectAttributes, ObjectId, ObjectKind};
