//! Coordination-store abstraction for authoritative metadata.
//!
//! The metadata of every volume lives in a hierarchical, ZooKeeper-like
//! namespace. This trait abstracts over the client so the transaction
//! pipeline can run against an in-memory store in tests and a real
//! ensemble in production.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};
use crate::types::{parent_path, validate_path};

/// A single sub-operation of an atomic multi-op.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    /// Create a node; fails if it exists or its parent does not.
    Create {
        /// Node path.
        path: String,
        /// Initial data.
        data: Vec<u8>,
    },
    /// Overwrite node data; fails if the node is missing or the version differs.
    SetData {
        /// Node path.
        path: String,
        /// New data.
        data: Vec<u8>,
        /// Required current version, `None` matches any version.
        expected_version: Option<i32>,
    },
    /// Delete a childless node; fails if it is missing.
    Delete {
        /// Node path.
        path: String,
    },
    /// Create the node, or overwrite it when it already exists.
    Upsert {
        /// Node path.
        path: String,
        /// Data to store.
        data: Vec<u8>,
    },
    /// Delete the node if present.
    DeleteIfExists {
        /// Node path.
        path: String,
    },
}

impl StoreOp {
    /// Returns the path this sub-operation targets.
    pub fn path(&self) -> &str {
        match self {
            StoreOp::Create { path, .. }
            | StoreOp::SetData { path, .. }
            | StoreOp::Delete { path }
            | StoreOp::Upsert { path, .. }
            | StoreOp::DeleteIfExists { path } => path,
        }
    }
}

/// Outcome of one applied sub-operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOpResult {
    /// A node was created.
    Created {
        /// Node path.
        path: String,
    },
    /// Node data was set; carries the new version.
    DataSet {
        /// Node path.
        path: String,
        /// Version after the write.
        version: i32,
    },
    /// A node was deleted.
    Deleted {
        /// Node path.
        path: String,
    },
    /// Nothing needed to change.
    Unchanged {
        /// Node path.
        path: String,
    },
}

/// Coordination store trait for metadata persistence.
///
/// Implementations must apply [`CoordinationStore::multi_op`] atomically:
/// either every sub-operation lands or none does.
pub trait CoordinationStore: Send + Sync {
    /// Create a node with the given data. Returns the initial version.
    fn create_path(&self, path: &str, data: &[u8]) -> MetaResult<i32>;

    /// Overwrite a node's data, optionally checking its current version.
    fn set_data(&self, path: &str, data: &[u8], expected_version: Option<i32>) -> MetaResult<i32>;

    /// Delete a childless node.
    fn delete(&self, path: &str) -> MetaResult<()>;

    /// Read a node's data and version. Returns None if it doesn't exist.
    fn get_data(&self, path: &str) -> MetaResult<Option<(Vec<u8>, i32)>>;

    /// Returns true if the node exists.
    fn exists(&self, path: &str) -> MetaResult<bool>;

    /// Names of the direct children of a node, sorted.
    fn get_children(&self, path: &str) -> MetaResult<Vec<String>>;

    /// Atomically apply a list of sub-operations.
    fn multi_op(&self, ops: Vec<StoreOp>) -> MetaResult<Vec<StoreOpResult>>;

    /// Create every missing node along `path` with empty data.
    fn ensure_path(&self, path: &str) -> MetaResult<()> {
        validate_path(path)?;
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if self.exists(&current)? {
                continue;
            }
            match self.create_path(&current, &[]) {
                Ok(_) | Err(MetaError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Create a node, creating missing ancestors first.
    fn create_recursive(&self, path: &str, data: &[u8]) -> MetaResult<()> {
        if let Some(parent) = parent_path(path) {
            self.ensure_path(parent)?;
        }
        self.create_path(path, data).map(|_| ())
    }

    /// Delete a node together with all of its descendants.
    fn delete_recursive(&self, path: &str) -> MetaResult<()> {
        let children = match self.get_children(path) {
            Ok(c) => c,
            Err(MetaError::NoNode { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in children {
            self.delete_recursive(&crate::types::join_path(path, &child))?;
        }
        match self.delete(path) {
            Ok(()) | Err(MetaError::NoNode { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Clone, Debug)]
struct Znode {
    data: Vec<u8>,
    version: i32,
}

/// In-memory coordination store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Follows ZooKeeper node semantics and can be switched into an
/// unavailable state to exercise failure handling.
pub struct MemoryCoordinationStore {
    nodes: RwLock<BTreeMap<String, Znode>>,
    unavailable: AtomicBool,
    multi_ops: AtomicU64,
}

impl MemoryCoordinationStore {
    /// Creates a store that only contains the root node.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Znode {
                data: Vec::new(),
                version: 0,
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            unavailable: AtomicBool::new(false),
            multi_ops: AtomicU64::new(0),
        }
    }

    /// Simulate loss of the coordination-store session.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of multi-ops that were applied successfully.
    pub fn multi_op_count(&self) -> u64 {
        self.multi_ops.load(Ordering::SeqCst)
    }

    /// Number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    /// Returns true if only the root node exists.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    fn check_available(&self) -> MetaResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MetaError::StoreUnavailable(
                "connection to coordination store lost".to_string(),
            ));
        }
        Ok(())
    }

    fn lock_err<E: std::fmt::Display>(e: E) -> MetaError {
        MetaError::StoreUnavailable(e.to_string())
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn has_children(nodes: &BTreeMap<String, Znode>, path: &str) -> bool {
    let prefix = child_prefix(path);
    nodes
        .range::<String, _>(prefix.clone()..)
        .find(|(k, _)| k.as_str() != path)
        .is_some_and(|(k, _)| k.starts_with(&prefix))
}

fn apply_op(nodes: &mut BTreeMap<String, Znode>, op: StoreOp) -> MetaResult<StoreOpResult> {
    validate_path(op.path())?;
    match op {
        StoreOp::Create { path, data } => {
            if nodes.contains_key(&path) {
                return Err(MetaError::NodeExists { path });
            }
            let parent = parent_path(&path).ok_or_else(|| MetaError::NodeExists {
                path: path.clone(),
            })?;
            if !nodes.contains_key(parent) {
                return Err(MetaError::NoNode {
                    path: parent.to_string(),
                });
            }
            nodes.insert(path.clone(), Znode { data, version: 0 });
            Ok(StoreOpResult::Created { path })
        }
        StoreOp::SetData {
            path,
            data,
            expected_version,
        } => {
            let node = nodes
                .get_mut(&path)
                .ok_or_else(|| MetaError::NoNode { path: path.clone() })?;
            if let Some(expected) = expected_version {
                if expected != node.version {
                    return Err(MetaError::BadVersion {
                        path,
                        expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data;
            node.version += 1;
            Ok(StoreOpResult::DataSet {
                version: node.version,
                path,
            })
        }
        StoreOp::Delete { path } => {
            if !nodes.contains_key(&path) {
                return Err(MetaError::NoNode { path });
            }
            if has_children(nodes, &path) {
                return Err(MetaError::NotEmpty { path });
            }
            nodes.remove(&path);
            Ok(StoreOpResult::Deleted { path })
        }
        StoreOp::Upsert { path, data } => {
            if nodes.contains_key(&path) {
                apply_op(
                    nodes,
                    StoreOp::SetData {
                        path,
                        data,
                        expected_version: None,
                    },
                )
            } else {
                apply_op(nodes, StoreOp::Create { path, data })
            }
        }
        StoreOp::DeleteIfExists { path } => {
            if nodes.contains_key(&path) {
                apply_op(nodes, StoreOp::Delete { path })
            } else {
                Ok(StoreOpResult::Unchanged { path })
            }
        }
    }
}

impl CoordinationStore for MemoryCoordinationStore {
    fn create_path(&self, path: &str, data: &[u8]) -> MetaResult<i32> {
        self.check_available()?;
        let mut nodes = self.nodes.write().map_err(Self::lock_err)?;
        apply_op(
            &mut nodes,
            StoreOp::Create {
                path: path.to_string(),
                data: data.to_vec(),
            },
        )?;
        Ok(0)
    }

    fn set_data(&self, path: &str, data: &[u8], expected_version: Option<i32>) -> MetaResult<i32> {
        self.check_available()?;
        let mut nodes = self.nodes.write().map_err(Self::lock_err)?;
        match apply_op(
            &mut nodes,
            StoreOp::SetData {
                path: path.to_string(),
                data: data.to_vec(),
                expected_version,
            },
        )? {
            StoreOpResult::DataSet { version, .. } => Ok(version),
            _ => Ok(0),
        }
    }

    fn delete(&self, path: &str) -> MetaResult<()> {
        self.check_available()?;
        let mut nodes = self.nodes.write().map_err(Self::lock_err)?;
        apply_op(
            &mut nodes,
            StoreOp::Delete {
                path: path.to_string(),
            },
        )?;
        Ok(())
    }

    fn get_data(&self, path: &str) -> MetaResult<Option<(Vec<u8>, i32)>> {
        self.check_available()?;
        let nodes = self.nodes.read().map_err(Self::lock_err)?;
        Ok(nodes.get(path).map(|n| (n.data.clone(), n.version)))
    }

    fn exists(&self, path: &str) -> MetaResult<bool> {
        self.check_available()?;
        let nodes = self.nodes.read().map_err(Self::lock_err)?;
        Ok(nodes.contains_key(path))
    }

    fn get_children(&self, path: &str) -> MetaResult<Vec<String>> {
        self.check_available()?;
        let nodes = self.nodes.read().map_err(Self::lock_err)?;
        if !nodes.contains_key(path) {
            return Err(MetaError::NoNode {
                path: path.to_string(),
            });
        }
        let prefix = child_prefix(path);
        let mut children = Vec::new();
        for (k, _) in nodes.range::<String, _>(prefix.clone()..) {
            if !k.starts_with(&prefix) {
                break;
            }
            let rest = &k[prefix.len()..];
            if !rest.is_empty() && !rest.contains('/') {
                children.push(rest.to_string());
            }
        }
        Ok(children)
    }

    fn multi_op(&self, ops: Vec<StoreOp>) -> MetaResult<Vec<StoreOpResult>> {
        self.check_available()?;
        let mut nodes = self.nodes.write().map_err(Self::lock_err)?;
        let mut staged = nodes.clone();
        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.into_iter().enumerate() {
            match apply_op(&mut staged, op) {
                Ok(r) => results.push(r),
                Err(e) => {
                    return Err(MetaError::MultiOpAborted {
                        index,
                        source: Box::new(e),
                    })
                }
            }
        }
        *nodes = staged;
        self.multi_ops.fetch_add(1, Ordering::SeqCst);
        Ok(results)
    }
}
