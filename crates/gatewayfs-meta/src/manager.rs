//! Transaction manager: staging, batching and dependency ordering.
//!
//! Committed transactions are staged and flushed into committers either when
//! the staged operation count reaches the threshold or when the staging list
//! has not changed for the commit interval. Every committer is queued on each
//! path it touches; a new committer depends on every committer already
//! queued on one of its paths, so writes to the same path land in
//! registration order while disjoint batches commit in parallel.
//!
//! All mutating state sits behind one coarse lock: computing a batch's path
//! set and registering it in the per-path queues must be atomic.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::committer::{Committer, CommitterHandle};
use crate::config::ManagerConfig;
use crate::coordination::CoordinationStore;
use crate::error::{MetaError, MetaResult};
use crate::journal::MetaJournal;
use crate::transaction::Transaction;
use crate::types::{parent_path, OperationKind, TransactionId};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Snapshot of manager counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Transactions waiting in the staging list.
    pub staged_transactions: usize,
    /// Operations waiting in the staging list.
    pub staged_ops: usize,
    /// Committers created but not yet finished.
    pub in_flight: usize,
    /// Committers that finished successfully.
    pub committed: u64,
    /// Committers whose multi-op failed.
    pub failed: u64,
}

struct ManagerState {
    staging: Vec<Transaction>,
    staged_ops: usize,
    last_staging_change: Instant,
    committing_paths: HashMap<String, VecDeque<Arc<CommitterHandle>>>,
    outstanding: HashMap<u64, Arc<CommitterHandle>>,
}

/// Batches committed transactions into dependency-ordered committers.
pub struct TransactionManager {
    config: ManagerConfig,
    store: Arc<dyn CoordinationStore>,
    journal: Arc<MetaJournal>,
    next_txn_id: AtomicU64,
    next_committer_id: AtomicU64,
    state: Mutex<ManagerState>,
    outstanding_tx: watch::Sender<usize>,
    commit_slots: Semaphore,
    runtime: Handle,
    periodic: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    committed: AtomicU64,
    failed: AtomicU64,
}

impl TransactionManager {
    /// Creates a manager on the current tokio runtime and starts its
    /// periodic flush task.
    pub fn start(
        config: ManagerConfig,
        store: Arc<dyn CoordinationStore>,
        journal: Arc<MetaJournal>,
    ) -> MetaResult<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| MetaError::Config(format!("no tokio runtime: {}", e)))?;
        if config.commit_threshold == 0 || config.max_concurrent_commits == 0 {
            return Err(MetaError::Config(
                "commit threshold and concurrency must be positive".to_string(),
            ));
        }
        let (outstanding_tx, _) = watch::channel(0usize);
        let manager = Arc::new(Self {
            commit_slots: Semaphore::new(config.max_concurrent_commits),
            config,
            store,
            journal,
            next_txn_id: AtomicU64::new(1),
            next_committer_id: AtomicU64::new(1),
            state: Mutex::new(ManagerState {
                staging: Vec::new(),
                staged_ops: 0,
                last_staging_change: Instant::now(),
                committing_paths: HashMap::new(),
                outstanding: HashMap::new(),
            }),
            outstanding_tx,
            runtime,
            periodic: Mutex::new(None),
            stopped: AtomicBool::new(false),
            committed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        manager.start_periodic();
        info!(
            interval_ms = manager.config.commit_interval.as_millis() as u64,
            threshold = manager.config.commit_threshold,
            "transaction manager started"
        );
        Ok(manager)
    }

    fn start_periodic(self: &Arc<Self>) {
        let tick = (self.config.commit_interval / 2).max(MIN_TICK);
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.commit_staging_txns_if_needed();
            }
        });
        *self.periodic.lock() = Some(handle);
    }

    /// The coordination store committers write to.
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// The journal transactions are recorded in.
    pub fn journal(&self) -> &Arc<MetaJournal> {
        &self.journal
    }

    /// Starts a new, empty transaction with a fresh id.
    pub fn new_transaction(&self) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction::new(TransactionId::new(id), Arc::clone(&self.journal))
    }

    /// Ensures future transaction ids are greater than `id`.
    pub fn advance_transaction_id(&self, id: TransactionId) {
        self.next_txn_id
            .fetch_max(id.as_u64().saturating_add(1), Ordering::SeqCst);
    }

    /// Commits `txn` if needed and stages it.
    ///
    /// Fails, without staging anything, if any of its operations could not
    /// be journaled. A rejected transaction's journal records are deleted.
    pub fn submit(self: &Arc<Self>, mut txn: Transaction) -> MetaResult<()> {
        if !txn.is_committed() {
            if let Err(e) = txn.commit() {
                txn.discard();
                return Err(e);
            }
        }
        self.add_transaction(txn)
    }

    /// Stages a committed transaction. Empty transactions succeed without
    /// being staged.
    ///
    /// A rejected transaction is discarded so journal recovery never
    /// applies it.
    pub fn add_transaction(self: &Arc<Self>, mut txn: Transaction) -> MetaResult<()> {
        if self.is_stopped() {
            txn.discard();
            return Err(MetaError::Stopped);
        }
        if let Some(e) = txn.durability_error() {
            txn.discard();
            return Err(e);
        }
        if txn.is_empty() {
            txn.discard();
            return Ok(());
        }
        if !txn.is_committed() {
            let id = txn.id().as_u64();
            txn.discard();
            return Err(MetaError::NotCommitted(id));
        }
        txn.mark_submitted();

        let mut state = self.state.lock();
        state.staged_ops += txn.len();
        state.staging.push(txn);
        state.last_staging_change = Instant::now();
        if state.staged_ops >= self.config.commit_threshold {
            self.commit_staging_locked(&mut state);
        }
        Ok(())
    }

    /// Flushes staged transactions that have been idle for the commit
    /// interval.
    pub fn commit_staging_txns_if_needed(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !state.staging.is_empty()
            && state.last_staging_change.elapsed() >= self.config.commit_interval
        {
            self.commit_staging_locked(&mut state);
        }
    }

    /// Moves every staged transaction into a new committer.
    pub fn commit_staging_txns(self: &Arc<Self>) {
        let mut state = self.state.lock();
        self.commit_staging_locked(&mut state);
    }

    fn commit_staging_locked(self: &Arc<Self>, state: &mut ManagerState) {
        if state.staging.is_empty() {
            return;
        }
        let transactions = std::mem::take(&mut state.staging);

        let mut staging_paths = BTreeSet::new();
        let mut dep_paths = BTreeSet::new();
        for txn in &transactions {
            for op in txn.operations() {
                let Some(path) = op.path() else { continue };
                staging_paths.insert(path.to_string());
                dep_paths.insert(path.to_string());
                if op.kind() == OperationKind::Create && parent_path(path) == Some("/") {
                    dep_paths.insert("/".to_string());
                }
            }
        }

        let mut dependencies = Vec::new();
        for path in &dep_paths {
            if let Some(queue) = state.committing_paths.get(path) {
                dependencies.extend(queue.iter().cloned());
            }
        }

        let id = self.next_committer_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(CommitterHandle::new(
            id,
            staging_paths,
            dependencies.len() as u32,
        ));
        for dependency in &dependencies {
            dependency.add_dependant(Arc::clone(&handle));
        }
        for path in handle.paths() {
            state
                .committing_paths
                .entry(path.clone())
                .or_default()
                .push_back(Arc::clone(&handle));
        }
        state.outstanding.insert(id, Arc::clone(&handle));
        self.outstanding_tx.send_replace(state.outstanding.len());

        debug!(
            committer = id,
            transactions = transactions.len(),
            ops = state.staged_ops,
            dependencies = dependencies.len(),
            "created committer"
        );

        let committer = Committer::new(Arc::clone(self), handle, transactions);
        self.runtime.spawn(committer.run());

        state.staged_ops = 0;
        state.last_staging_change = Instant::now();
    }

    /// Called by a committer once it is done, whatever the outcome.
    pub(crate) fn finish_commit(&self, handle: &Arc<CommitterHandle>, success: bool) {
        let mut state = self.state.lock();
        for dependant in handle.take_dependants() {
            dependant.release_one();
        }
        for path in handle.paths() {
            if let Some(queue) = state.committing_paths.get_mut(path) {
                queue.retain(|c| c.id() != handle.id());
                if queue.is_empty() {
                    state.committing_paths.remove(path);
                }
            }
        }
        state.outstanding.remove(&handle.id());
        if success {
            self.committed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.outstanding_tx.send_replace(state.outstanding.len());
    }

    pub(crate) async fn acquire_commit_slot(&self) -> MetaResult<SemaphorePermit<'_>> {
        self.commit_slots
            .acquire()
            .await
            .map_err(|_| MetaError::Stopped)
    }

    /// Commits everything staged so far and waits until no committer is
    /// outstanding. Failed commits count as finished.
    pub async fn flush(self: &Arc<Self>) -> MetaResult<()> {
        self.commit_staging_txns();
        let mut outstanding = self.outstanding_tx.subscribe();
        outstanding
            .wait_for(|count| *count == 0)
            .await
            .map_err(|_| MetaError::Stopped)?;
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> ManagerStats {
        let state = self.state.lock();
        ManagerStats {
            staged_transactions: state.staging.len(),
            staged_ops: state.staged_ops,
            in_flight: state.outstanding.len(),
            committed: self.committed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Refuses new transactions and stops the periodic flush. Staged work is
    /// left in place; call [`TransactionManager::flush`] first to drain it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.periodic.lock().take() {
            handle.abort();
        }
        info!("transaction manager stopped");
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.periodic.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::coordination::MemoryCoordinationStore;
    use crate::transaction::OpOutcome;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryCoordinationStore>,
        manager: Arc<TransactionManager>,
    }

    fn fixture(interval: Duration, threshold: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let journal = Arc::new(MetaJournal::open(JournalConfig::new(dir.path())).unwrap());
        let store = Arc::new(MemoryCoordinationStore::new());
        let manager = TransactionManager::start(
            ManagerConfig {
                commit_interval: interval,
                commit_threshold: threshold,
                max_concurrent_commits: 4,
            },
            store.clone(),
            journal,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            store,
            manager,
        }
    }

    fn data(store: &MemoryCoordinationStore, path: &str) -> Option<Vec<u8>> {
        store.get_data(path).unwrap().map(|(d, _)| d)
    }

    #[tokio::test]
    async fn test_submit_and_flush() {
        let f = fixture(Duration::from_secs(3600), 1000);
        let mut txn = f.manager.new_transaction();
        txn.create("/x", b"v1").unwrap();
        f.manager.submit(txn).unwrap();
        assert_eq!(f.manager.stats().staged_transactions, 1);
        assert_eq!(data(&f.store, "/x"), None);

        f.manager.flush().await.unwrap();
        assert_eq!(data(&f.store, "/x"), Some(b"v1".to_vec()));
        let stats = f.manager.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(f.manager.journal().live_records(), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_rejected() {
        let f = fixture(Duration::from_secs(3600), 1000);
        let mut txn = f.manager.new_transaction();
        txn.create("/x", b"v1").unwrap();
        let id = txn.id().as_u64();
        let err = f.manager.add_transaction(txn).unwrap_err();
        assert!(matches!(err, MetaError::NotCommitted(n) if n == id));
        assert_eq!(f.manager.stats().staged_transactions, 0);
        assert_eq!(f.manager.journal().live_records(), 0);
    }

    #[tokio::test]
    async fn test_stopped_manager_discards_rejected_transaction() {
        let f = fixture(Duration::from_secs(3600), 1000);
        f.manager.stop();
        let mut txn = f.manager.new_transaction();
        txn.create("/rejected", b"r").unwrap();
        let err = f.manager.submit(txn).unwrap_err();
        assert!(matches!(err, MetaError::Stopped));
        assert_eq!(f.manager.journal().live_records(), 0);
    }

    #[tokio::test]
    async fn test_empty_transaction_is_a_noop() {
        let f = fixture(Duration::from_secs(3600), 1000);
        let txn = f.manager.new_transaction();
        f.manager.submit(txn).unwrap();
        assert_eq!(f.manager.stats().staged_transactions, 0);
        assert_eq!(f.manager.journal().live_records(), 0);
    }

    #[tokio::test]
    async fn test_threshold_triggers_commit() {
        let f = fixture(Duration::from_secs(3600), 4);
        let mut txn = f.manager.new_transaction();
        txn.create("/a", b"1").unwrap();
        f.manager.submit(txn).unwrap();
        assert_eq!(f.manager.stats().staged_ops, 2);

        let mut txn = f.manager.new_transaction();
        txn.create("/b", b"2").unwrap();
        f.manager.submit(txn).unwrap();
        let stats = f.manager.stats();
        assert_eq!(stats.staged_ops, 0);
        assert_eq!(stats.staged_transactions, 0);

        let mut outstanding = f.manager.outstanding_tx.subscribe();
        outstanding.wait_for(|n| *n == 0).await.unwrap();
        assert_eq!(data(&f.store, "/b"), Some(b"2".to_vec()));
        assert_eq!(f.store.multi_op_count(), 1);
    }

    #[tokio::test]
    async fn test_interval_triggers_commit() {
        let f = fixture(Duration::from_millis(20), 1000);
        let mut txn = f.manager.new_transaction();
        txn.create("/a", b"1").unwrap();
        f.manager.submit(txn).unwrap();

        for _ in 0..200 {
            if data(&f.store, "/a").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(data(&f.store, "/a"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_same_path_committers_are_chained() {
        let f = fixture(Duration::from_secs(3600), 1000);
        f.store.create_path("/a", b"0").unwrap();
        let mut handles = Vec::new();
        {
            let mut state = f.manager.state.lock();
            for i in 1..=3u8 {
                let mut txn = f.manager.new_transaction();
                txn.update("/a", &[i]).unwrap();
                txn.commit().unwrap();
                txn.mark_submitted();
                state.staged_ops += txn.len();
                state.staging.push(txn);
                f.manager.commit_staging_locked(&mut state);
                handles.push(state.committing_paths["/a"].back().unwrap().clone());
            }
            let queue: Vec<u64> = state.committing_paths["/a"].iter().map(|c| c.id()).collect();
            assert_eq!(queue, handles.iter().map(|h| h.id()).collect::<Vec<_>>());
        }
        f.manager.flush().await.unwrap();
        assert_eq!(data(&f.store, "/a"), Some(vec![3]));
        assert!(f.manager.state.lock().committing_paths.is_empty());
    }

    #[tokio::test]
    async fn test_root_level_create_depends_on_root_writers() {
        let f = fixture(Duration::from_secs(3600), 1000);
        let mut state = f.manager.state.lock();

        let mut txn = f.manager.new_transaction();
        txn.update("/", b"root").unwrap();
        txn.commit().unwrap();
        txn.mark_submitted();
        state.staging.push(txn);
        f.manager.commit_staging_locked(&mut state);
        let first = state.committing_paths["/"].front().unwrap().clone();

        let mut txn = f.manager.new_transaction();
        txn.create("/vol", b"").unwrap();
        txn.commit().unwrap();
        txn.mark_submitted();
        state.staging.push(txn);
        f.manager.commit_staging_locked(&mut state);

        assert_eq!(first.take_dependants().len(), 1);
        drop(state);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_journal_and_reports_failure() {
        let f = fixture(Duration::from_secs(3600), 1000);
        let outcome = Arc::new(Mutex::new(None::<OpOutcome>));
        let mut txn = f.manager.new_transaction();
        let sink = outcome.clone();
        txn.create("/a", b"1").unwrap();
        txn.update_with_callback(
            "/missing/child",
            b"2",
            Box::new(move |o: OpOutcome| *sink.lock() = Some(o)),
        )
        .unwrap();
        f.manager.submit(txn).unwrap();
        f.manager.flush().await.unwrap();

        assert_eq!(data(&f.store, "/a"), None);
        assert!(matches!(*outcome.lock(), Some(OpOutcome::Failed(_))));
        assert_eq!(f.manager.stats().failed, 1);
        assert_eq!(f.manager.journal().live_records(), 3);
    }

    #[tokio::test]
    async fn test_callbacks_report_applied_and_superseded() {
        let f = fixture(Duration::from_secs(3600), 1000);
        let outcomes = Arc::new(Mutex::new(Vec::<(u8, OpOutcome)>::new()));
        let mut txn = f.manager.new_transaction();
        txn.create("/a", b"0").unwrap();
        for i in 1..=2u8 {
            let sink = outcomes.clone();
            txn.update_with_callback("/a", &[i], Box::new(move |o: OpOutcome| sink.lock().push((i, o))))
                .unwrap();
        }
        f.manager.submit(txn).unwrap();
        f.manager.flush().await.unwrap();

        let mut outcomes = outcomes.lock().clone();
        outcomes.sort_by_key(|(i, _)| *i);
        assert_eq!(outcomes[0], (1, OpOutcome::Superseded));
        assert!(matches!(outcomes[1], (2, OpOutcome::Applied(_))));
    }

    #[tokio::test]
    async fn test_stop_refuses_new_work() {
        let f = fixture(Duration::from_secs(3600), 1000);
        f.manager.stop();
        let mut txn = f.manager.new_transaction();
        txn.create("/a", b"1").unwrap();
        txn.commit().unwrap();
        assert!(matches!(
            f.manager.add_transaction(txn),
            Err(MetaError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_advance_transaction_id() {
        let f = fixture(Duration::from_secs(3600), 1000);
        f.manager.advance_transaction_id(TransactionId::new(41));
        assert_eq!(f.manager.new_transaction().id(), TransactionId::new(42));
        f.manager.advance_transaction_id(TransactionId::new(3));
        assert_eq!(f.manager.new_transaction().id(), TransactionId::new(43));
    }
}
