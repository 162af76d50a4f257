//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use gatewayfs_meta::{
    CoordinationClient, JournalConfig, ManagerConfig, MemoryCoordinationStore, MetaJournal,
    TransactionManager,
};
use tempfile::TempDir;

use crate::block::{BlockLoader, BlockRef, BlockStamp, BlockVersion, MemoryKvs};
use crate::conflict::ConflictResolver;
use crate::namespace::VolumeRegistry;
use crate::types::{GatewayId, ObjectId, ObjectKind};

pub(crate) fn gw(name: &str) -> GatewayId {
    GatewayId::from_name(name).unwrap()
}

pub(crate) fn dir_oid(id: u128, creator: &str) -> ObjectId {
    ObjectId::new(id, gw(creator), ObjectKind::Directory)
}

pub(crate) fn file_oid(id: u128, creator: &str) -> ObjectId {
    ObjectId::new(id, gw(creator), ObjectKind::File)
}

/// One gateway over in-memory stores. Nothing commits until the client is
/// flushed.
pub(crate) struct Fixture {
    _dir: TempDir,
    pub store: Arc<MemoryCoordinationStore>,
    pub client: Arc<CoordinationClient>,
    pub registry: Arc<VolumeRegistry>,
    pub kvs: Arc<MemoryKvs>,
    pub resolver: ConflictResolver,
}

impl Fixture {
    pub fn new(local: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryCoordinationStore::new());
        let journal = Arc::new(MetaJournal::open(JournalConfig::new(dir.path())).unwrap());
        let manager = TransactionManager::start(
            ManagerConfig {
                commit_interval: Duration::from_secs(3600),
                commit_threshold: 100_000,
                max_concurrent_commits: 4,
            },
            store.clone(),
            journal,
        )
        .unwrap();
        let client = Arc::new(CoordinationClient::new(manager, 64));
        let registry = Arc::new(VolumeRegistry::new(client.clone(), gw(local)));
        let kvs = Arc::new(MemoryKvs::new());
        let resolver = ConflictResolver::new(BlockLoader::new(kvs.clone()));
        Self {
            _dir: dir,
            store,
            client,
            registry,
            kvs,
            resolver,
        }
    }

    pub fn new_resolver(&self) -> ConflictResolver {
        ConflictResolver::new(BlockLoader::new(self.kvs.clone()))
    }

    /// Stores a block blob written by `writer` at `timestamp`.
    pub fn store_block(&self, file: ObjectId, index: u64, version: u64, writer: &str, timestamp: u64) {
        let block = BlockRef {
            file,
            index,
            version: BlockVersion {
                version,
                gateway: gw(writer),
            },
        };
        let stamp = BlockStamp {
            timestamp,
            gateway: gw(writer),
        };
        BlockLoader::new(self.kvs.clone())
            .store(&block, stamp, b"data")
            .unwrap();
    }
}
