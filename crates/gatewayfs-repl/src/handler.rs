//! Gateway message handler: receives remote messages, orders them by lock
//! key and replays them through the conflict resolver on a bounded pool of
//! workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gatewayfs_meta::GatewayConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::conflict::{ConflictResolver, ResolveOutcome};
use crate::error::{ReplError, ReplResult};
use crate::message::{CreateVolume, GatewayMessage, GatewayMessageFilter, GatewayOp};
use crate::message_manager::{GatewayMessageManager, ReleasedMessage};
use crate::namespace::{Volume, VolumeRegistry};
use crate::types::GatewayId;

/// Called when a message still fails after every attempt.
pub type FatalHook = Arc<dyn Fn(&GatewayMessage, &ReplError) + Send + Sync>;

/// Handler settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// This gateway.
    pub local_gateway: GatewayId,
    /// Messages processed in parallel.
    pub worker_threads: usize,
    /// Attempts per message before the fatal hook runs.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl HandlerConfig {
    /// Derives handler settings from the gateway config.
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            local_gateway: GatewayId(config.gateway_id),
            worker_threads: config.message_worker_threads,
            max_attempts: config.message_max_attempts,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Snapshot of handler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStats {
    /// Messages accepted by the filter.
    pub received: u64,
    /// Messages replayed successfully.
    pub processed: u64,
    /// Messages that exhausted their attempts.
    pub failed: u64,
    /// Messages waiting for their lock keys.
    pub pending: usize,
}

/// Replays messages from remote gateways.
pub struct GatewayMessageHandler {
    config: HandlerConfig,
    filter: GatewayMessageFilter,
    manager: GatewayMessageManager,
    resolver: ConflictResolver,
    volumes: Arc<VolumeRegistry>,
    workers: Arc<Semaphore>,
    wakeup: Notify,
    idle: watch::Sender<bool>,
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    stopped: AtomicBool,
    fatal: FatalHook,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayMessageHandler {
    /// Creates a handler. Call [`GatewayMessageHandler::start`] to begin
    /// processing.
    pub fn new(
        config: HandlerConfig,
        volumes: Arc<VolumeRegistry>,
        resolver: ConflictResolver,
    ) -> Self {
        let workers = config.worker_threads.max(1);
        let (idle, _) = watch::channel(true);
        Self {
            filter: GatewayMessageFilter::new(config.local_gateway),
            config,
            manager: GatewayMessageManager::new(),
            resolver,
            volumes,
            workers: Arc::new(Semaphore::new(workers)),
            wakeup: Notify::new(),
            idle,
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            fatal: Arc::new(exit_on_failure),
            task: Mutex::new(None),
        }
    }

    /// Replaces the action taken when a message cannot be replayed. The
    /// default logs and exits the process.
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal = hook;
        self
    }

    /// The conflict resolver.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// The volumes messages are replayed into.
    pub fn volumes(&self) -> &Arc<VolumeRegistry> {
        &self.volumes
    }

    /// Decodes and queues a message from transport. Returns false if the
    /// filter dropped it.
    pub fn receive(&self, bytes: &[u8]) -> ReplResult<bool> {
        let msg = GatewayMessage::decode(bytes)?;
        self.submit(msg)
    }

    /// Queues a decoded message. Returns false if the filter dropped it.
    pub fn submit(&self, msg: GatewayMessage) -> ReplResult<bool> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ReplError::Shutdown);
        }
        if !self.filter.accept(&msg) {
            return Ok(false);
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        // Queued under the idle lock so a finishing worker cannot report
        // idle between the two steps.
        self.idle.send_modify(|idle| {
            self.manager.put(msg);
            *idle = false;
        });
        self.wakeup.notify_one();
        Ok(true)
    }

    /// Spawns the dispatch loop on the current runtime.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run().await }));
        info!(
            gateway = %self.config.local_gateway,
            workers = self.config.worker_threads,
            "gateway message handler started"
        );
    }

    /// Stops releasing messages. Messages already being processed finish.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!("gateway message handler stopped");
    }

    /// Waits until every queued message has been processed.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Current counters.
    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.manager.pending_len(),
        }
    }

    async fn run(self: Arc<Self>) {
        while !self.stopped.load(Ordering::SeqCst) {
            let Some(released) = self.manager.poll() else {
                self.wakeup.notified().await;
                continue;
            };
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.process(released).await;
                drop(permit);
            });
        }
        debug!("dispatch loop exited");
    }

    async fn process(self: &Arc<Self>, released: ReleasedMessage) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let this = Arc::clone(self);
            let job = released.clone();
            let result = tokio::task::spawn_blocking(move || this.dispatch(job.message()))
                .await
                .unwrap_or_else(|e| {
                    Err(ReplError::Task {
                        msg: e.to_string(),
                    })
                });

            let msg = released.message();
            match result {
                Ok(outcome) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    debug!(id = msg.id, gateway = %msg.gateway, op = msg.op.name(), ?outcome, "message replayed");
                    break;
                }
                Err(e) if attempt < max_attempts => {
                    warn!(id = msg.id, op = msg.op.name(), attempt, "message replay failed, retrying: {}", e);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(id = msg.id, gateway = %msg.gateway, op = msg.op.name(), attempt, "message replay failed: {}", e);
                    (self.fatal)(msg, &e);
                    break;
                }
            }
        }

        self.manager.end(&released);
        let manager = &self.manager;
        self.idle.send_if_modified(|idle| {
            let now = manager.is_idle();
            let changed = *idle != now;
            *idle = now;
            changed
        });
        self.wakeup.notify_one();
    }

    fn dispatch(&self, msg: &GatewayMessage) -> ReplResult<ResolveOutcome> {
        let resolver = &self.resolver;
        match &msg.op {
            GatewayOp::CreateVolume(op) => self.create_volume(&msg.volume, op),
            GatewayOp::CreateDir(op) => self.with_volume(msg, |v| resolver.resolve_create_dir(v, op)),
            GatewayOp::CreateFile(op) => {
                self.with_volume(msg, |v| resolver.resolve_create_file(v, op))
            }
            GatewayOp::UpdateFile(op) => {
                self.with_volume(msg, |v| resolver.resolve_update_file(v, msg.gateway, op))
            }
            GatewayOp::UnlinkFile(op) => {
                self.with_volume(msg, |v| resolver.resolve_unlink_file(v, op))
            }
            GatewayOp::RemoveDir(op) => self.with_volume(msg, |v| resolver.resolve_remove_dir(v, op)),
            GatewayOp::Rename(op) => self.with_volume(msg, |v| resolver.resolve_rename(v, op)),
            GatewayOp::SetAttributes(op) => {
                self.with_volume(msg, |v| resolver.resolve_set_attributes(v, op))
            }
            GatewayOp::RemoveVolume => {
                warn!(volume = %msg.volume, gateway = %msg.gateway, "volume removal is not supported");
                Ok(ResolveOutcome::Skipped)
            }
            GatewayOp::Commit
            | GatewayOp::ClaimMaster
            | GatewayOp::AckMaster
            | GatewayOp::RenounceMaster => {
                debug!(id = msg.id, op = msg.op.name(), "control message");
                Ok(ResolveOutcome::Skipped)
            }
        }
    }

    fn with_volume<F>(&self, msg: &GatewayMessage, f: F) -> ReplResult<ResolveOutcome>
    where
        F: FnOnce(&Volume) -> ReplResult<ResolveOutcome>,
    {
        match self.volumes.get(&msg.volume)? {
            Some(volume) => f(&volume),
            None => self
                .resolver
                .ignore_missing_dependency(&format!("volume {}", msg.volume)),
        }
    }

    fn create_volume(&self, name: &str, op: &CreateVolume) -> ReplResult<ResolveOutcome> {
        match self.volumes.create(name, op.root, op.attrs.clone()) {
            Ok(_) => Ok(ResolveOutcome::Applied),
            Err(ReplError::VolumeExists(_)) => Ok(ResolveOutcome::AlreadyConsistent),
            Err(e) => Err(e),
        }
    }
}

impl Drop for GatewayMessageHandler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for GatewayMessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMessageHandler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn exit_on_failure(msg: &GatewayMessage, err: &ReplError) {
    error!(
        id = msg.id,
        gateway = %msg.gateway,
        volume = %msg.volume,
        op = msg.op.name(),
        "irrecoverable replication failure, exiting: {}",
        err
    );
    std::process::exit(1);
}
