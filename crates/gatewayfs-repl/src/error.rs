//! Error types for the replication subsystem.

use gatewayfs_meta::MetaError;
use thiserror::Error;

use crate::types::ObjectId;

/// Errors that can occur while replaying remote gateway operations.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Failure in the metadata pipeline underneath the namespace.
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// Object is not known to this gateway.
    #[error("object not found: {oid}")]
    ObjectNotFound {
        /// The missing object.
        oid: ObjectId,
    },

    /// A directory operation targeted something that is not a directory.
    #[error("not a directory: {oid}")]
    NotADirectory {
        /// The offending object.
        oid: ObjectId,
    },

    /// A name is already taken by an object this gateway created itself.
    #[error("name conflict in {parent}: {name}")]
    NameConflict {
        /// Directory holding the name.
        parent: ObjectId,
        /// Conflicting name.
        name: String,
    },

    /// A non-empty directory would have been replaced or removed.
    #[error("directory not empty: {oid}")]
    NotEmpty {
        /// The directory.
        oid: ObjectId,
    },

    /// A rename moved an object other than the one the message named.
    #[error("rename moved {actual}, expected {expected}")]
    RenameConflict {
        /// Object named by the remote operation.
        expected: ObjectId,
        /// Object actually found under the source name.
        actual: ObjectId,
    },

    /// The message is structurally unusable.
    #[error("invalid message: {msg}")]
    InvalidMessage {
        /// Error message describing the issue.
        msg: String,
    },

    /// A block blob is not (yet) present in the cloud store.
    #[error("block missing: {key}")]
    BlockMissing {
        /// Key of the block.
        key: String,
    },

    /// A block blob is too short or otherwise unreadable.
    #[error("corrupt block {key}: {msg}")]
    CorruptBlock {
        /// Key of the block.
        key: String,
        /// Error message describing the corruption.
        msg: String,
    },

    /// Key-value cloud store error.
    #[error("kvs error: {msg}")]
    Kvs {
        /// Error message describing the issue.
        msg: String,
    },

    /// A volume with this name already exists.
    #[error("volume already exists: {0}")]
    VolumeExists(String),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {msg}")]
    Task {
        /// Error message describing the failure.
        msg: String,
    },

    /// Message handler was shut down.
    #[error("message handler shut down")]
    Shutdown,
}

impl ReplError {
    /// Returns true when a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplError::Meta(e) => e.is_transient(),
            ReplError::BlockMissing { .. } | ReplError::Kvs { .. } | ReplError::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type for replication operations.
pub type ReplResult<T> = std::result::Result<T, ReplError>;
