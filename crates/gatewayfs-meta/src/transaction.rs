//! Metadata transactions.
//!
//! A transaction is an ordered list of coordination-store mutations that
//! must land atomically. Each operation is journaled as it is appended, and
//! [`Transaction::commit`] writes the terminal COMMIT marker. Only committed
//! transactions are accepted by the manager.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::coordination::StoreOpResult;
use crate::error::{MetaError, MetaResult};
use crate::journal::{JournalLocation, JournalRecord, MetaJournal};
use crate::types::{digest, now_millis, validate_path, OperationKind, TransactionId};

/// Outcome reported to an operation's result callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpOutcome {
    /// The operation was part of a successful commit.
    Applied(StoreOpResult),
    /// A later UPDATE of the same path in the same batch replaced it.
    Superseded,
    /// The commit containing the operation failed.
    Failed(String),
}

/// Invoked once after the operation's commit attempt.
pub type ResultCallback = Box<dyn FnOnce(OpOutcome) + Send + 'static>;

/// A single mutation intent against one coordination-store path.
pub struct Operation {
    kind: OperationKind,
    path: Option<String>,
    data: Option<Vec<u8>>,
    timestamp: u64,
    callback: Option<ResultCallback>,
    location: Option<JournalLocation>,
    replayed: bool,
}

impl Operation {
    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Target path; `None` for COMMIT.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Payload; `None` for REMOVE and COMMIT.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Milliseconds since the epoch when the operation was appended.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Where the operation was journaled.
    pub fn location(&self) -> Option<JournalLocation> {
        self.location
    }

    /// True if the operation was reconstructed from the journal.
    pub fn is_replayed(&self) -> bool {
        self.replayed
    }

    pub(crate) fn take_callback(&mut self) -> Option<ResultCallback> {
        self.callback.take()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("data", &digest(self.data.as_deref()))
            .field("location", &self.location)
            .field("replayed", &self.replayed)
            .finish()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} data={} ts={}",
            self.kind,
            self.path.as_deref().unwrap_or("-"),
            digest(self.data.as_deref()),
            self.timestamp
        )
    }
}

/// An ordered group of operations committed atomically.
pub struct Transaction {
    id: TransactionId,
    operations: Vec<Operation>,
    committed: bool,
    submitted: bool,
    durability_failure: Option<String>,
    journal: Arc<MetaJournal>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, journal: Arc<MetaJournal>) -> Self {
        Self {
            id,
            operations: Vec::new(),
            committed: false,
            submitted: false,
            durability_failure: None,
            journal,
        }
    }

    /// Rebuilds a committed transaction from its journal records.
    pub(crate) fn replayed(
        id: TransactionId,
        records: Vec<(JournalLocation, JournalRecord)>,
        journal: Arc<MetaJournal>,
    ) -> Self {
        let operations = records
            .into_iter()
            .map(|(location, record)| Operation {
                kind: record.kind,
                path: record.path,
                data: record.data,
                timestamp: record.timestamp,
                callback: None,
                location: Some(location),
                replayed: true,
            })
            .collect();
        Self {
            id,
            operations,
            committed: true,
            submitted: false,
            durability_failure: None,
            journal,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// True once the COMMIT marker has been appended.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Number of operations, including the COMMIT marker.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True if the transaction holds no mutation (a lone COMMIT counts as empty).
    pub fn is_empty(&self) -> bool {
        self.operations
            .iter()
            .all(|op| op.kind == OperationKind::Commit)
    }

    /// Operations in append order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Distinct paths touched by this transaction.
    pub fn paths(&self) -> BTreeSet<String> {
        self.operations
            .iter()
            .filter_map(|op| op.path.clone())
            .collect()
    }

    /// Appends a CREATE of `path` with `data`.
    pub fn create(&mut self, path: &str, data: &[u8]) -> MetaResult<()> {
        self.push(OperationKind::Create, Some(path), Some(data), None)
    }

    /// Appends a CREATE whose commit outcome is reported to `callback`.
    pub fn create_with_callback(
        &mut self,
        path: &str,
        data: &[u8],
        callback: ResultCallback,
    ) -> MetaResult<()> {
        self.push(OperationKind::Create, Some(path), Some(data), Some(callback))
    }

    /// Appends an UPDATE of `path` to `data`.
    pub fn update(&mut self, path: &str, data: &[u8]) -> MetaResult<()> {
        self.push(OperationKind::Update, Some(path), Some(data), None)
    }

    /// Appends an UPDATE whose commit outcome is reported to `callback`.
    pub fn update_with_callback(
        &mut self,
        path: &str,
        data: &[u8],
        callback: ResultCallback,
    ) -> MetaResult<()> {
        self.push(OperationKind::Update, Some(path), Some(data), Some(callback))
    }

    /// Appends a REMOVE of `path`.
    pub fn delete(&mut self, path: &str) -> MetaResult<()> {
        self.push(OperationKind::Remove, Some(path), None, None)
    }

    /// Appends the COMMIT marker; no further operations may be added.
    pub fn commit(&mut self) -> MetaResult<()> {
        self.push(OperationKind::Commit, None, None, None)?;
        self.committed = true;
        Ok(())
    }

    /// Drops the transaction without submitting it, deleting its journal
    /// records.
    pub fn discard(mut self) {
        self.submitted = true;
        for op in &self.operations {
            if let Some(location) = op.location {
                if let Err(e) = self.journal.delete(location) {
                    warn!(txn = %self.id, error = %e, "failed to delete journal record");
                }
            }
        }
    }

    fn push(
        &mut self,
        kind: OperationKind,
        path: Option<&str>,
        data: Option<&[u8]>,
        callback: Option<ResultCallback>,
    ) -> MetaResult<()> {
        if self.committed {
            return Err(MetaError::TransactionCommitted(self.id.as_u64()));
        }
        if let Some(p) = path {
            validate_path(p)?;
        }
        let location = match self.journal.append(self.id, kind, path, data) {
            Ok(location) => location,
            Err(e) => {
                self.durability_failure = Some(e.to_string());
                return Err(e);
            }
        };
        self.operations.push(Operation {
            kind,
            path: path.map(str::to_string),
            data: data.map(<[u8]>::to_vec),
            timestamp: now_millis(),
            callback,
            location: Some(location),
            replayed: false,
        });
        Ok(())
    }

    /// Error to report if any append of this transaction was not durable.
    pub(crate) fn durability_error(&self) -> Option<MetaError> {
        self.durability_failure
            .as_ref()
            .map(|reason| MetaError::Durability {
                txn_id: self.id.as_u64(),
                reason: reason.clone(),
            })
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.submitted = true;
    }

    pub(crate) fn operations_mut(&mut self) -> &mut [Operation] {
        &mut self.operations
    }

    pub(crate) fn journal_locations(&self) -> impl Iterator<Item = JournalLocation> + '_ {
        self.operations.iter().filter_map(|op| op.location)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transaction-{} ({} ops)", self.id, self.operations.len())?;
        for op in &self.operations {
            write!(f, "\n  {}", op)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("operations", &self.operations)
            .field("committed", &self.committed)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.submitted && !self.is_empty() {
            warn!(
                txn = %self.id,
                ops = self.operations.len(),
                "transaction dropped without being submitted or discarded"
            );
        }
    }
}
