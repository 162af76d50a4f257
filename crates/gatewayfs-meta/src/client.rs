//! Coordination client facade.
//!
//! Wraps the coordination store with an overlay of writes that were
//! submitted but not necessarily committed yet, so later reads in this
//! process observe them. [`CoordinationClient::flush`] drops the entries
//! submitted before it started once the manager has drained.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::coordination::CoordinationStore;
use crate::error::{MetaError, MetaResult};
use crate::manager::TransactionManager;
use crate::transaction::Transaction;
use crate::types::{parent_path, OperationKind};

/// Writes and deletes not yet confirmed by a flush. Every entry carries the
/// sequence number of the change that produced it, so a flush retires only
/// what was submitted before it started.
#[derive(Debug, Default)]
struct InTransactionCache {
    znodes: HashMap<String, (u64, Vec<u8>)>,
    deleted: HashMap<String, u64>,
    seq: u64,
}

impl InTransactionCache {
    fn put(&mut self, path: String, data: Vec<u8>) {
        self.seq += 1;
        self.deleted.remove(&path);
        self.znodes.insert(path, (self.seq, data));
    }

    fn remove(&mut self, path: String) {
        self.seq += 1;
        self.znodes.remove(&path);
        self.deleted.insert(path, self.seq);
    }

    fn mark(&self) -> u64 {
        self.seq
    }

    /// Drops entries recorded at or before `mark`.
    fn retire(&mut self, mark: u64) {
        self.znodes.retain(|_, (seq, _)| *seq > mark);
        self.deleted.retain(|_, seq| *seq > mark);
    }
}

enum OverlayChange {
    Put(String, Vec<u8>),
    Remove(String),
}

/// Coordination-store client with an in-process overlay of pending writes.
pub struct CoordinationClient {
    store: Arc<dyn CoordinationStore>,
    manager: Arc<TransactionManager>,
    cache: Mutex<InTransactionCache>,
    existing_paths: Mutex<LruCache<String, ()>>,
}

impl CoordinationClient {
    /// Creates a client over the manager's store. `existing_path_cache_size`
    /// bounds the LRU of paths known to exist.
    pub fn new(manager: Arc<TransactionManager>, existing_path_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(existing_path_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: Arc::clone(manager.store()),
            manager,
            cache: Mutex::new(InTransactionCache::default()),
            existing_paths: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The transaction manager behind this client.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// The underlying coordination store.
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Reads a node, consulting the overlay first.
    pub fn read(&self, path: &str) -> MetaResult<Vec<u8>> {
        {
            let cache = self.cache.lock();
            if cache.deleted.contains_key(path) {
                return Err(MetaError::NoNode {
                    path: path.to_string(),
                });
            }
            if let Some((_, data)) = cache.znodes.get(path) {
                return Ok(data.clone());
            }
        }
        match self.store.get_data(path)? {
            Some((data, _)) => Ok(data),
            None => Err(MetaError::NoNode {
                path: path.to_string(),
            }),
        }
    }

    /// Like [`CoordinationClient::read`] but maps a missing node to `None`.
    pub fn try_read(&self, path: &str) -> MetaResult<Option<Vec<u8>>> {
        match self.read(path) {
            Ok(data) => Ok(Some(data)),
            Err(MetaError::NoNode { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns true if the node exists, including pending writes.
    pub fn check_exists(&self, path: &str) -> MetaResult<bool> {
        {
            let cache = self.cache.lock();
            if cache.deleted.contains_key(path) {
                return Ok(false);
            }
            if cache.znodes.contains_key(path) {
                return Ok(true);
            }
        }
        self.store.exists(path)
    }

    /// Creates every missing ancestor of `path` (and `path` itself unless
    /// `exclude_last`), remembering paths already known to exist.
    pub fn ensure_path(&self, path: &str, exclude_last: bool) -> MetaResult<()> {
        let target = if exclude_last {
            match parent_path(path) {
                Some(parent) => parent,
                None => return Ok(()),
            }
        } else {
            path
        };
        if self.existing_paths.lock().get(target).is_some() {
            return Ok(());
        }
        self.store.ensure_path(target)?;
        self.existing_paths.lock().put(target.to_string(), ());
        Ok(())
    }

    /// Creates a node and any missing ancestors directly in the store.
    pub fn create_recursive(&self, path: &str, data: &[u8]) -> MetaResult<()> {
        self.store.create_recursive(path, data)
    }

    /// Deletes a subtree directly in the store.
    pub fn delete_recursive(&self, path: &str) -> MetaResult<()> {
        self.store.delete_recursive(path)?;
        self.existing_paths.lock().clear();
        Ok(())
    }

    /// Starts a new transaction.
    pub fn new_transaction(&self) -> Transaction {
        self.manager.new_transaction()
    }

    /// Submits a transaction and, once it is accepted, records its writes in
    /// the overlay.
    pub fn submit_transaction(&self, txn: Transaction) -> MetaResult<()> {
        let changes: Vec<OverlayChange> = txn
            .operations()
            .iter()
            .filter_map(|op| {
                let path = op.path()?.to_string();
                match op.kind() {
                    OperationKind::Create | OperationKind::Update => Some(OverlayChange::Put(
                        path,
                        op.data().unwrap_or_default().to_vec(),
                    )),
                    OperationKind::Remove => Some(OverlayChange::Remove(path)),
                    OperationKind::Commit => None,
                }
            })
            .collect();

        self.manager.submit(txn)?;

        let mut cache = self.cache.lock();
        let mut removed = false;
        for change in changes {
            match change {
                OverlayChange::Put(path, data) => cache.put(path, data),
                OverlayChange::Remove(path) => {
                    cache.remove(path);
                    removed = true;
                }
            }
        }
        drop(cache);
        if removed {
            self.existing_paths.lock().clear();
        }
        Ok(())
    }

    /// Waits for every submitted transaction to finish, then drops the
    /// overlay entries those transactions produced. Entries submitted while
    /// the flush was running stay until the next flush.
    pub async fn flush(&self) -> MetaResult<()> {
        let mark = self.cache.lock().mark();
        self.manager.flush().await?;
        self.cache.lock().retire(mark);
        debug!("coordination client flushed");
        Ok(())
    }

    /// Lists children after flushing, so the store view is complete.
    pub async fn list_children(&self, path: &str) -> MetaResult<Vec<String>> {
        self.flush().await?;
        self.store.get_children(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JournalConfig, ManagerConfig};
    use crate::coordination::MemoryCoordinationStore;
    use crate::journal::MetaJournal;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn client() -> (TempDir, Arc<MemoryCoordinationStore>, CoordinationClient) {
        let dir = tempdir().unwrap();
        let journal = Arc::new(MetaJournal::open(JournalConfig::new(dir.path())).unwrap());
        let store = Arc::new(MemoryCoordinationStore::new());
        let manager = TransactionManager::start(
            ManagerConfig {
                commit_interval: Duration::from_secs(3600),
                commit_threshold: 10_000,
                max_concurrent_commits: 4,
            },
            store.clone(),
            journal,
        )
        .unwrap();
        (dir, store, CoordinationClient::new(manager, 16))
    }

    #[tokio::test]
    async fn test_overlay_serves_pending_writes() {
        let (_dir, store, client) = client();
        let mut txn = client.new_transaction();
        txn.create("/a", b"v1").unwrap();
        client.submit_transaction(txn).unwrap();

        assert!(!store.exists("/a").unwrap());
        assert_eq!(client.read("/a").unwrap(), b"v1".to_vec());
        assert!(client.check_exists("/a").unwrap());

        client.flush().await.unwrap();
        assert_eq!(client.read("/a").unwrap(), b"v1".to_vec());
        assert!(store.exists("/a").unwrap());
    }

    #[tokio::test]
    async fn test_overlay_hides_pending_deletes() {
        let (_dir, store, client) = client();
        store.create_path("/a", b"stale").unwrap();

        let mut txn = client.new_transaction();
        txn.delete("/a").unwrap();
        client.submit_transaction(txn).unwrap();

        assert!(matches!(client.read("/a"), Err(MetaError::NoNode { .. })));
        assert_eq!(client.try_read("/a").unwrap(), None);
        assert!(!client.check_exists("/a").unwrap());

        client.flush().await.unwrap();
        assert!(!store.exists("/a").unwrap());
    }

    #[tokio::test]
    async fn test_flush_keeps_writes_submitted_after_it_started() {
        let (_dir, store, client) = client();
        let mut txn = client.new_transaction();
        txn.create("/a", b"old").unwrap();
        client.submit_transaction(txn).unwrap();

        let mark = client.cache.lock().mark();
        let mut txn = client.new_transaction();
        txn.create("/b", b"new").unwrap();
        client.submit_transaction(txn).unwrap();
        client.cache.lock().retire(mark);

        assert!(!store.exists("/b").unwrap());
        assert_eq!(client.read("/b").unwrap(), b"new".to_vec());
        assert!(!client.cache.lock().znodes.contains_key("/a"));
        client.flush().await.unwrap();
        assert!(client.cache.lock().znodes.is_empty());
        assert_eq!(client.read("/b").unwrap(), b"new".to_vec());
    }

    #[tokio::test]
    async fn test_read_missing_node() {
        let (_dir, _store, client) = client();
        assert!(matches!(
            client.read("/nope"),
            Err(MetaError::NoNode { ref path }) if path == "/nope"
        ));
    }

    #[tokio::test]
    async fn test_ensure_path_excluding_last() {
        let (_dir, store, client) = client();
        client.ensure_path("/vol/objects/leaf", true).unwrap();
        assert!(store.exists("/vol/objects").unwrap());
        assert!(!store.exists("/vol/objects/leaf").unwrap());

        client.ensure_path("/vol/objects/leaf", false).unwrap();
        assert!(store.exists("/vol/objects/leaf").unwrap());
        client.ensure_path("/", true).unwrap();
    }

    #[tokio::test]
    async fn test_ensure_path_uses_cache() {
        let (_dir, store, client) = client();
        client.ensure_path("/cached", false).unwrap();
        store.delete("/cached").unwrap();
        client.ensure_path("/cached", false).unwrap();
        assert!(!store.exists("/cached").unwrap());

        client.delete_recursive("/other").unwrap();
        client.ensure_path("/cached", false).unwrap();
        assert!(store.exists("/cached").unwrap());
    }

    #[tokio::test]
    async fn test_list_children_flushes_first() {
        let (_dir, _store, client) = client();
        let mut txn = client.new_transaction();
        txn.create("/d", b"").unwrap();
        txn.create("/d/x", b"").unwrap();
        txn.create("/d/y", b"").unwrap();
        client.submit_transaction(txn).unwrap();
        assert_eq!(
            client.list_children("/d").await.unwrap(),
            vec!["x".to_string(), "y".to_string()]
        );
    }
}
