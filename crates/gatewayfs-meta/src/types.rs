//! Core identifiers, operation kinds and coordination-store path helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MetaError, MetaResult};

/// Unique identifier of a metadata transaction, monotonically increasing per process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Creates a new transaction ID from a raw u64 value
    pub fn new(id: u64) -> Self {
        TransactionId(id)
    }

    /// Returns the raw u64 value of this transaction ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a single coordination-store mutation recorded in a transaction
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create a new node
    Create,
    /// Overwrite the data of an existing node
    Update,
    /// Remove a node
    Remove,
    /// Terminal marker of a transaction
    Commit,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Remove => "REMOVE",
            OperationKind::Commit => "COMMIT",
        };
        f.write_str(s)
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Checks that `path` is an absolute, normalized coordination-store path.
pub fn validate_path(path: &str) -> MetaResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(MetaError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Returns the parent of a coordination-store path; the parent of a
/// top-level node is `/` and the root has no parent.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Joins a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Short, stable digest of a payload for log lines.
pub(crate) fn digest(data: Option<&[u8]>) -> String {
    match data {
        None => "null".to_string(),
        Some(bytes) => format!("{}B:{:08x}", bytes.len(), crc32fast::hash(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a/b/c"), Some("/a/b"));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::Create.to_string(), "CREATE");
        assert_eq!(OperationKind::Commit.to_string(), "COMMIT");
    }

    #[test]
    fn test_transaction_id_ordering() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
        assert_eq!(TransactionId::new(7).as_u64(), 7);
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest(None), "null");
        assert_eq!(digest(Some(b"v1")), digest(Some(b"v1")));
        assert_ne!(digest(Some(b"v1")), digest(Some(b"v2")));
    }
}
