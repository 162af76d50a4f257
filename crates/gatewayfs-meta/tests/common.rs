//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gatewayfs_meta::{
    CoordinationClient, JournalConfig, ManagerConfig, MemoryCoordinationStore, MetaJournal,
    RecoveryStats, TransactionManager,
};
use tempfile::TempDir;

/// Settings for a test gateway; by default nothing is committed until an
/// explicit flush.
#[derive(Clone, Debug)]
pub struct TestConfig {
    pub commit_interval: Duration,
    pub commit_threshold: usize,
    pub max_concurrent_commits: usize,
    pub max_segment_bytes: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_secs(3600),
            commit_threshold: 100_000,
            max_concurrent_commits: 8,
            max_segment_bytes: 1 << 20,
        }
    }
}

/// One gateway's metadata pipeline over an in-memory coordination store.
pub struct TestGateway {
    pub dir: TempDir,
    pub config: TestConfig,
    pub store: Arc<MemoryCoordinationStore>,
    pub journal: Arc<MetaJournal>,
    pub manager: Arc<TransactionManager>,
    pub client: CoordinationClient,
}

impl TestGateway {
    pub fn new(config: TestConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryCoordinationStore::new());
        let (journal, manager, client) = Self::open(&dir, &config, &store);
        Self {
            dir,
            config,
            store,
            journal,
            manager,
            client,
        }
    }

    fn open(
        dir: &TempDir,
        config: &TestConfig,
        store: &Arc<MemoryCoordinationStore>,
    ) -> (Arc<MetaJournal>, Arc<TransactionManager>, CoordinationClient) {
        let journal = Arc::new(
            MetaJournal::open(JournalConfig {
                dir: dir.path().to_path_buf(),
                max_segment_bytes: config.max_segment_bytes,
                cleanup_interval: Duration::from_secs(3600),
            })
            .unwrap(),
        );
        let manager = TransactionManager::start(
            ManagerConfig {
                commit_interval: config.commit_interval,
                commit_threshold: config.commit_threshold,
                max_concurrent_commits: config.max_concurrent_commits,
            },
            store.clone(),
            journal.clone(),
        )
        .unwrap();
        let client = CoordinationClient::new(manager.clone(), 64);
        (journal, manager, client)
    }

    /// Simulates a crash: staged work is abandoned without flushing, the
    /// journal is reopened from disk and replayed into a fresh manager. The
    /// coordination store keeps its contents.
    pub fn crash_and_recover(self) -> (Self, RecoveryStats) {
        let TestGateway {
            dir,
            config,
            store,
            journal,
            manager,
            client,
        } = self;
        manager.stop();
        drop(client);
        drop(manager);
        drop(journal);

        let (journal, manager, client) = Self::open(&dir, &config, &store);
        let stats = journal.recover(&manager).unwrap();
        (
            Self {
                dir,
                config,
                store,
                journal,
                manager,
                client,
            },
            stats,
        )
    }

    pub fn stored(&self, path: &str) -> Option<Vec<u8>> {
        use gatewayfs_meta::CoordinationStore;
        self.store.get_data(path).unwrap().map(|(d, _)| d)
    }
}
