#![warn(missing_docs)]

//! GatewayFS metadata subsystem: write-ahead journal, transaction batching and
//! dependency-ordered atomic commits to the coordination store

pub mod client;
mod committer;
pub mod config;
pub mod coordination;
pub mod error;
pub mod journal;
pub mod manager;
pub mod transaction;
pub mod types;

pub use client::CoordinationClient;
pub use config::{GatewayConfig, JournalConfig, ManagerConfig};
pub use coordination::{CoordinationStore, MemoryCoordinationStore, StoreOp, StoreOpResult};
pub use error::{MetaError, MetaResult};
pub use journal::{JournalLocation, JournalRecord, MetaJournal, RecoveryStats};
pub use manager::{ManagerStats, TransactionManager};
pub use transaction::{OpOutcome, Operation, ResultCallback, Transaction};
pub use types::{OperationKind, TransactionId};
