//! Atomic commit of one batch of staged transactions.
//!
//! A committer merges redundant UPDATEs, waits until every earlier committer
//! on an overlapping path has finished, then applies the surviving
//! operations as a single coordination-store multi-op. Journal records are
//! deleted only after the multi-op succeeds.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::coordination::StoreOp;
use crate::error::{MetaError, MetaResult};
use crate::manager::TransactionManager;
use crate::transaction::{OpOutcome, Operation, ResultCallback, Transaction};
use crate::types::OperationKind;

/// Shared view of a committer used for dependency tracking.
pub(crate) struct CommitterHandle {
    id: u64,
    paths: BTreeSet<String>,
    required: u32,
    released: Semaphore,
    dependants: Mutex<Vec<Arc<CommitterHandle>>>,
}

impl CommitterHandle {
    pub(crate) fn new(id: u64, paths: BTreeSet<String>, required: u32) -> Self {
        Self {
            id,
            paths,
            required,
            released: Semaphore::new(0),
            dependants: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn paths(&self) -> &BTreeSet<String> {
        &self.paths
    }

    pub(crate) fn add_dependant(&self, dependant: Arc<CommitterHandle>) {
        self.dependants.lock().push(dependant);
    }

    pub(crate) fn take_dependants(&self) -> Vec<Arc<CommitterHandle>> {
        std::mem::take(&mut *self.dependants.lock())
    }

    /// Counts down one finished dependency.
    pub(crate) fn release_one(&self) {
        self.released.add_permits(1);
    }

    async fn wait_for_dependencies(&self) -> MetaResult<()> {
        if self.required == 0 {
            return Ok(());
        }
        let permits = self
            .released
            .acquire_many(self.required)
            .await
            .map_err(|_| MetaError::Stopped)?;
        permits.forget();
        Ok(())
    }
}

/// One commit attempt for a batch of transactions.
pub(crate) struct Committer {
    manager: Arc<TransactionManager>,
    handle: Arc<CommitterHandle>,
    transactions: Vec<Transaction>,
}

/// Reports the committer as finished however `run` exits.
struct FinishGuard {
    manager: Arc<TransactionManager>,
    handle: Arc<CommitterHandle>,
    success: bool,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.manager.finish_commit(&self.handle, self.success);
    }
}

impl Committer {
    pub(crate) fn new(
        manager: Arc<TransactionManager>,
        handle: Arc<CommitterHandle>,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            manager,
            handle,
            transactions,
        }
    }

    pub(crate) async fn run(self) {
        let Committer {
            manager,
            handle,
            mut transactions,
        } = self;
        let mut guard = FinishGuard {
            manager: Arc::clone(&manager),
            handle: Arc::clone(&handle),
            success: false,
        };
        guard.success = commit_batch(&manager, &handle, &mut transactions).await;
    }
}

async fn commit_batch(
    manager: &Arc<TransactionManager>,
    handle: &CommitterHandle,
    transactions: &mut [Transaction],
) -> bool {
    let superseded = merge_updates(transactions);
    warn_on_update_before_create(handle.id(), transactions, &superseded);

    if let Err(e) = handle.wait_for_dependencies().await {
        error!(committer = handle.id(), error = %e, "dependency wait aborted");
        return false;
    }
    let _slot = match manager.acquire_commit_slot().await {
        Ok(permit) => permit,
        Err(e) => {
            error!(committer = handle.id(), error = %e, "no commit slot available");
            return false;
        }
    };

    let mut store_ops = Vec::new();
    let mut callbacks: Vec<Option<ResultCallback>> = Vec::new();
    let mut superseded_callbacks = Vec::new();
    for (ti, txn) in transactions.iter_mut().enumerate() {
        for (oi, op) in txn.operations_mut().iter_mut().enumerate() {
            if superseded.contains(&(ti, oi)) {
                superseded_callbacks.extend(op.take_callback());
                continue;
            }
            if let Some(store_op) = to_store_op(op) {
                callbacks.push(op.take_callback());
                store_ops.push(store_op);
            }
        }
    }

    let op_count = store_ops.len();
    let result = if store_ops.is_empty() {
        Ok(Vec::new())
    } else {
        let store = Arc::clone(manager.store());
        match tokio::task::spawn_blocking(move || store.multi_op(store_ops)).await {
            Ok(result) => result,
            Err(e) => Err(MetaError::StoreUnavailable(format!(
                "commit task did not complete: {}",
                e
            ))),
        }
    };

    match result {
        Ok(results) => {
            for (callback, result) in callbacks.into_iter().zip(results) {
                if let Some(callback) = callback {
                    callback(OpOutcome::Applied(result));
                }
            }
            for callback in superseded_callbacks {
                callback(OpOutcome::Superseded);
            }
            for txn in transactions.iter() {
                for location in txn.journal_locations() {
                    if let Err(e) = manager.journal().delete(location) {
                        warn!(txn = %txn.id(), error = %e, "failed to delete journal record");
                    }
                }
            }
            debug!(
                committer = handle.id(),
                transactions = transactions.len(),
                ops = op_count,
                merged = superseded.len(),
                "committed batch"
            );
            true
        }
        Err(e) => {
            error!(committer = handle.id(), error = %e, "coordination store transaction failed to commit");
            error!(
                "Committer-{} with {} transactions:",
                handle.id(),
                transactions.len()
            );
            for txn in transactions.iter() {
                error!("{}", txn);
            }
            let reason = e.to_string();
            for callback in callbacks.into_iter().flatten().chain(superseded_callbacks) {
                callback(OpOutcome::Failed(reason.clone()));
            }
            false
        }
    }
}

/// Returns `(transaction index, operation index)` of every UPDATE that a
/// later UPDATE of the same path in the batch makes redundant.
pub(crate) fn merge_updates(transactions: &[Transaction]) -> HashSet<(usize, usize)> {
    let mut last_update: HashMap<&str, (usize, usize)> = HashMap::new();
    let mut superseded = HashSet::new();
    for (ti, txn) in transactions.iter().enumerate() {
        for (oi, op) in txn.operations().iter().enumerate() {
            if op.kind() != OperationKind::Update {
                continue;
            }
            if let Some(path) = op.path() {
                if let Some(previous) = last_update.insert(path, (ti, oi)) {
                    superseded.insert(previous);
                }
            }
        }
    }
    superseded
}

/// Logs UPDATEs that reach the store ahead of a CREATE of the same path.
fn warn_on_update_before_create(
    committer: u64,
    transactions: &[Transaction],
    superseded: &HashSet<(usize, usize)>,
) {
    let mut pending_updates: HashSet<&str> = HashSet::new();
    for (ti, txn) in transactions.iter().enumerate() {
        for (oi, op) in txn.operations().iter().enumerate() {
            let Some(path) = op.path() else { continue };
            match op.kind() {
                OperationKind::Update if !superseded.contains(&(ti, oi)) => {
                    pending_updates.insert(path);
                }
                OperationKind::Remove => {
                    pending_updates.remove(path);
                }
                OperationKind::Create if pending_updates.contains(path) => {
                    warn!(
                        committer,
                        txn = %txn.id(),
                        path,
                        "UPDATE precedes CREATE of the same path within a batch"
                    );
                }
                _ => {}
            }
        }
    }
}

/// Maps an operation to its store sub-operation. Replayed operations use
/// the tolerant variants because the original commit may already have
/// landed.
pub(crate) fn to_store_op(op: &Operation) -> Option<StoreOp> {
    let path = op.path()?.to_string();
    let data = || op.data().unwrap_or_default().to_vec();
    let store_op = match (op.kind(), op.is_replayed()) {
        (OperationKind::Commit, _) => return None,
        (OperationKind::Create, false) => StoreOp::Create { path, data: data() },
        (OperationKind::Update, false) => StoreOp::SetData {
            path,
            data: data(),
            expected_version: None,
        },
        (OperationKind::Remove, false) => StoreOp::Delete { path },
        (OperationKind::Create | OperationKind::Update, true) => {
            StoreOp::Upsert { path, data: data() }
        }
        (OperationKind::Remove, true) => StoreOp::DeleteIfExists { path },
    };
    Some(store_op)
}
