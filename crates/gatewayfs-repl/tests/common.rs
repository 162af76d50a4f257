//! Common test utilities: a gateway wired from in-memory stores.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gatewayfs_meta::{
    CoordinationClient, JournalConfig, ManagerConfig, MemoryCoordinationStore, MetaJournal,
    TransactionManager,
};
use gatewayfs_repl::{
    BlockLoader, ConflictResolver, GatewayId, GatewayMessage, GatewayMessageHandler,
    HandlerConfig, MemoryKvs, ObjectAttributes, ObjectId, ObjectKind, ReplError, Volume,
    VolumeRegistry,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub fn gw(name: &str) -> GatewayId {
    GatewayId::from_name(name).unwrap()
}

pub fn dir_oid(id: u128, creator: &str) -> ObjectId {
    ObjectId::new(id, gw(creator), ObjectKind::Directory)
}

pub fn file_oid(id: u128, creator: &str) -> ObjectId {
    ObjectId::new(id, gw(creator), ObjectKind::File)
}

pub fn attrs() -> ObjectAttributes {
    ObjectAttributes {
        mode: 0o755,
        nlinks: 1,
        ..Default::default()
    }
}

/// One gateway: its own coordination store, journal and message handler.
/// Block blobs live in a cloud store shared by every gateway.
pub struct TestGateway {
    pub id: GatewayId,
    pub dir: TempDir,
    pub store: Arc<MemoryCoordinationStore>,
    pub client: Arc<CoordinationClient>,
    pub registry: Arc<VolumeRegistry>,
    pub handler: Arc<GatewayMessageHandler>,
    pub failures: Arc<Mutex<Vec<(u64, String)>>>,
}

impl TestGateway {
    pub fn new(name: &str, kvs: Arc<MemoryKvs>) -> Self {
        let id = gw(name);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryCoordinationStore::new());
        let journal = Arc::new(MetaJournal::open(JournalConfig::new(dir.path())).unwrap());
        let manager = TransactionManager::start(
            ManagerConfig {
                commit_interval: Duration::from_millis(20),
                commit_threshold: 1000,
                max_concurrent_commits: 4,
            },
            store.clone(),
            journal,
        )
        .unwrap();
        let client = Arc::new(CoordinationClient::new(manager, 256));
        let registry = Arc::new(VolumeRegistry::new(client.clone(), id));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let handler = GatewayMessageHandler::new(
            HandlerConfig {
                local_gateway: id,
                worker_threads: 4,
                max_attempts: 3,
                retry_delay: Duration::from_millis(2),
            },
            registry.clone(),
            ConflictResolver::new(BlockLoader::new(kvs)),
        )
        .with_fatal_hook(Arc::new(move |m: &GatewayMessage, e: &ReplError| {
            sink.lock().push((m.id, e.to_string()))
        }));
        let handler = Arc::new(handler);
        handler.start();
        Self {
            id,
            dir,
            store,
            client,
            registry,
            handler,
            failures,
        }
    }

    pub fn volume(&self, name: &str) -> Arc<Volume> {
        self.registry.get(name).unwrap().unwrap()
    }

    /// Delivers messages and waits until they are all replayed.
    pub async fn deliver(&self, messages: &[GatewayMessage]) {
        for msg in messages {
            let bytes = msg.encode().unwrap();
            self.handler.receive(&bytes).unwrap();
        }
        self.handler.wait_idle().await;
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.handler.stop();
    }
}
