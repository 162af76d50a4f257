//! Error types for the metadata subsystem.

use thiserror::Error;

/// Result type alias for metadata operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Error variants for journal, transaction and coordination-store operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The coordination-store node already exists.
    #[error("node already exists: {path}")]
    NodeExists {
        /// Path of the existing node.
        path: String,
    },

    /// The coordination-store node does not exist.
    #[error("no node: {path}")]
    NoNode {
        /// Path of the missing node.
        path: String,
    },

    /// Attempted to delete a node that still has children.
    #[error("node not empty: {path}")]
    NotEmpty {
        /// Path of the non-empty node.
        path: String,
    },

    /// Conditional update saw a different node version.
    #[error("bad version for {path}: expected {expected}, actual {actual}")]
    BadVersion {
        /// Path of the node.
        path: String,
        /// Version the caller expected.
        expected: i32,
        /// Version currently stored.
        actual: i32,
    },

    /// A sub-operation of an atomic multi-op failed; nothing was applied.
    #[error("multi-op aborted at operation {index}: {source}")]
    MultiOpAborted {
        /// Index of the failing sub-operation.
        index: usize,
        /// The failure of that sub-operation.
        #[source]
        source: Box<MetaError>,
    },

    /// The coordination store cannot be reached (session loss, network).
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// A path is not a valid absolute coordination-store path.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// Operations were appended to a transaction after its COMMIT marker.
    #[error("transaction {0} is already committed")]
    TransactionCommitted(u64),

    /// A transaction was handed to the manager without its COMMIT marker.
    #[error("transaction {0} has not been committed")]
    NotCommitted(u64),

    /// The journal could not make an operation durable.
    #[error("journal append failed for transaction {txn_id}: {reason}")]
    Durability {
        /// The transaction whose operation was lost.
        txn_id: u64,
        /// Description of the underlying failure.
        reason: String,
    },

    /// Journal contents could not be decoded.
    #[error("journal corrupted in segment {segment} at offset {offset}: {reason}")]
    JournalCorrupted {
        /// Segment number.
        segment: u32,
        /// Byte offset of the bad frame.
        offset: u64,
        /// Description of the corruption.
        reason: String,
    },

    /// The manager has been stopped and refuses new work.
    #[error("transaction manager stopped")]
    Stopped,

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    /// Returns true for failures that may succeed when retried later
    /// (for example after a restart replays the journal).
    pub fn is_transient(&self) -> bool {
        match self {
            MetaError::StoreUnavailable(_) | MetaError::IoError(_) => true,
            MetaError::MultiOpAborted { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_exists_display() {
        let err = MetaError::NodeExists {
            path: "/vol/a".to_string(),
        };
        assert_eq!(format!("{}", err), "node already exists: /vol/a");
    }

    #[test]
    fn test_bad_version_display() {
        let err = MetaError::BadVersion {
            path: "/x".to_string(),
            expected: 3,
            actual: 5,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("actual 5"));
    }

    #[test]
    fn test_multi_op_aborted_wraps_source() {
        let err = MetaError::MultiOpAborted {
            index: 2,
            source: Box::new(MetaError::NoNode {
                path: "/missing".to_string(),
            }),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("operation 2"));
        assert!(msg.contains("/missing"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(MetaError::StoreUnavailable("session expired".into()).is_transient());
        assert!(!MetaError::NodeExists { path: "/a".into() }.is_transient());
        let nested = MetaError::MultiOpAborted {
            index: 0,
            source: Box::new(MetaError::StoreUnavailable("down".into())),
        };
        assert!(nested.is_transient());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MetaError = std_err.into();
        assert!(matches!(err, MetaError::IoError(_)));
    }
}
