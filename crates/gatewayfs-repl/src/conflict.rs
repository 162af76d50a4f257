//! Conflict resolution for operations replayed from remote gateways.
//!
//! Every remote operation is applied against the local namespace, which may
//! already have diverged. The rules:
//!
//! - A missing parent, source or destination means the operation depends on
//!   something this gateway never saw or already removed; it is ignored.
//! - Creating a name that is taken stores the remote object under a
//!   gateway-suffixed name.
//! - Removing an object that was locally renamed or repopulated leaves it in
//!   place and stops replicating it.
//! - Concurrent writes to a block keep the newer write, ties broken by the
//!   larger gateway id.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{pick_winner, BlockLoader, BlockRef, BlockVersion, Winner};
use crate::error::{ReplError, ReplResult};
use crate::message::{CreateDir, CreateFile, RemoveDir, Rename, SetAttributes, UnlinkFile, UpdateFile};
use crate::namespace::{CreateOutcome, RemoveOutcome, Volume};
use crate::types::{GatewayId, ObjectId};

/// What replaying one remote operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Applied as sent.
    Applied,
    /// Applied under a conflict-suffixed name.
    Renamed {
        /// Name the object was stored under.
        name: String,
    },
    /// A file write where at least one block conflicted with a local write.
    Merged {
        /// Blocks where the remote version was adopted.
        remote_blocks: usize,
        /// Blocks where the local version was kept.
        local_blocks: usize,
    },
    /// Ignored because an object it depends on does not exist here.
    MissingDependency,
    /// Already reflected locally.
    AlreadyConsistent,
    /// The target diverged locally and no longer replicates.
    NoReplication,
    /// Nothing to do for this operation.
    Skipped,
}

/// Snapshot of the resolver's conflict counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictStats {
    /// Remote file creations that hit a taken name.
    pub create_file_conflicts: u64,
    /// Remote directory creations that hit a taken name.
    pub create_dir_conflicts: u64,
    /// Remote writes that overlapped local writes.
    pub update_file_conflicts: u64,
    /// Conflicts resolved without operator action.
    pub conflicts_resolved: u64,
}

/// Applies remote operations to local volumes, resolving conflicts.
#[derive(Debug)]
pub struct ConflictResolver {
    blocks: BlockLoader,
    create_file_conflicts: AtomicU64,
    create_dir_conflicts: AtomicU64,
    update_file_conflicts: AtomicU64,
    conflicts_resolved: AtomicU64,
}

impl ConflictResolver {
    /// Creates a resolver that reads block timestamps through `blocks`.
    pub fn new(blocks: BlockLoader) -> Self {
        Self {
            blocks,
            create_file_conflicts: AtomicU64::new(0),
            create_dir_conflicts: AtomicU64::new(0),
            update_file_conflicts: AtomicU64::new(0),
            conflicts_resolved: AtomicU64::new(0),
        }
    }

    /// Current counter values.
    pub fn stats(&self) -> ConflictStats {
        ConflictStats {
            create_file_conflicts: self.create_file_conflicts.load(Ordering::Relaxed),
            create_dir_conflicts: self.create_dir_conflicts.load(Ordering::Relaxed),
            update_file_conflicts: self.update_file_conflicts.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
        }
    }

    /// Skips an operation whose prerequisite is absent. Always succeeds.
    pub fn ignore_missing_dependency(&self, what: &str) -> ReplResult<ResolveOutcome> {
        warn!("ignoring remote operation, missing dependency: {}", what);
        Ok(ResolveOutcome::MissingDependency)
    }

    /// Replays a remote directory creation.
    pub fn resolve_create_dir(
        &self,
        volume: &Volume,
        op: &CreateDir,
    ) -> ReplResult<ResolveOutcome> {
        if volume.directory(op.parent)?.is_none() {
            return self.ignore_missing_dependency(&format!("parent {} of dir {}", op.parent, op.name));
        }
        let outcome = volume.create_child_dir(op.parent, &op.name, op.oid, op.attrs.clone())?;
        Ok(self.created(outcome, &self.create_dir_conflicts))
    }

    /// Replays a remote file creation.
    pub fn resolve_create_file(
        &self,
        volume: &Volume,
        op: &CreateFile,
    ) -> ReplResult<ResolveOutcome> {
        if volume.directory(op.parent)?.is_none() {
            return self.ignore_missing_dependency(&format!("parent {} of file {}", op.parent, op.name));
        }
        let outcome = volume.create_child_file(
            op.parent,
            &op.name,
            op.oid,
            op.attrs.clone(),
            op.block_size,
        )?;
        Ok(self.created(outcome, &self.create_file_conflicts))
    }

    fn created(&self, outcome: CreateOutcome, counter: &AtomicU64) -> ResolveOutcome {
        match outcome {
            CreateOutcome::Created {
                name,
                suffixed: true,
            } => {
                counter.fetch_add(1, Ordering::Relaxed);
                self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                info!(name = %name, "name conflict resolved with suffix");
                ResolveOutcome::Renamed { name }
            }
            CreateOutcome::Created { .. } => ResolveOutcome::Applied,
            CreateOutcome::AlreadyExists { .. } => ResolveOutcome::AlreadyConsistent,
        }
    }

    /// Replays a remote file removal.
    pub fn resolve_unlink_file(
        &self,
        volume: &Volume,
        op: &UnlinkFile,
    ) -> ReplResult<ResolveOutcome> {
        self.remove(volume, op.parent, &op.name, op.oid)
    }

    /// Replays a remote directory removal.
    pub fn resolve_remove_dir(
        &self,
        volume: &Volume,
        op: &RemoveDir,
    ) -> ReplResult<ResolveOutcome> {
        self.remove(volume, op.parent, &op.name, op.oid)
    }

    fn remove(
        &self,
        volume: &Volume,
        parent: ObjectId,
        name: &str,
        oid: ObjectId,
    ) -> ReplResult<ResolveOutcome> {
        if volume.directory(parent)?.is_some()
            && volume.remove_child(parent, name, oid)? == RemoveOutcome::Removed
        {
            return Ok(ResolveOutcome::Applied);
        }
        if volume.exists(oid)? {
            // Renamed or repopulated here; keep the local copy and stop
            // pushing its changes.
            let marked = volume.set_no_replication(oid)?;
            self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
            info!(oid = %oid, name = %name, marked, "remote removal diverged from local state");
            return Ok(ResolveOutcome::NoReplication);
        }
        debug!(oid = %oid, "object already removed");
        Ok(ResolveOutcome::AlreadyConsistent)
    }

    /// Replays a remote rename.
    pub fn resolve_rename(&self, volume: &Volume, op: &Rename) -> ReplResult<ResolveOutcome> {
        if volume.directory(op.src_dir)?.is_none() {
            return self.ignore_missing_dependency(&format!("rename source dir {}", op.src_dir));
        }
        if !volume.has_child(op.src_dir, &op.src_name, op.src_oid)? {
            return self.ignore_missing_dependency(&format!(
                "rename source {} ({})",
                op.src_name, op.src_oid
            ));
        }
        if volume.directory(op.dst_dir)?.is_none() {
            return self.ignore_missing_dependency(&format!("rename destination dir {}", op.dst_dir));
        }
        let moved = volume.rename_child(op.src_dir, &op.src_name, op.dst_dir, &op.dst_name)?;
        if moved != op.src_oid {
            return Err(ReplError::RenameConflict {
                expected: op.src_oid,
                actual: moved,
            });
        }
        Ok(ResolveOutcome::Applied)
    }

    /// Replays a remote attribute change.
    pub fn resolve_set_attributes(
        &self,
        volume: &Volume,
        op: &SetAttributes,
    ) -> ReplResult<ResolveOutcome> {
        if volume.set_attributes(op.oid, &op.attrs)? {
            Ok(ResolveOutcome::Applied)
        } else {
            info!(oid = %op.oid, "attributes of unknown object not applied");
            Ok(ResolveOutcome::Skipped)
        }
    }

    /// Replays a remote write, choosing per block between the local and the
    /// remote version.
    ///
    /// A block is taken from the remote without comparison when its version
    /// is newer and the local version was written by the same remote
    /// gateway. Otherwise the block timestamps decide; a local block that
    /// was never written (or whose blob is gone) always loses.
    pub fn resolve_update_file(
        &self,
        volume: &Volume,
        remote: GatewayId,
        op: &UpdateFile,
    ) -> ReplResult<ResolveOutcome> {
        let result = volume.modify_file(op.file, |file| {
            let block_size = u64::from(file.block_size.max(1));
            let end = op.offset.saturating_add(op.length);
            let first = op.offset / block_size;
            let last = if op.length == 0 {
                first
            } else {
                end.div_ceil(block_size)
            };
            if (op.new_versions.len() as u64) < last - first {
                return Err(ReplError::InvalidMessage {
                    msg: format!(
                        "{} versions for {} blocks of {}",
                        op.new_versions.len(),
                        last - first,
                        op.file
                    ),
                });
            }

            let mut conflicted = false;
            let mut remote_blocks = 0;
            let mut local_blocks = 0;
            for (index, &remote_version) in (first..last).zip(op.new_versions.iter()) {
                let local = file.block(index);
                let incoming = BlockVersion {
                    version: remote_version,
                    gateway: remote,
                };
                if remote_version == 0 || local == incoming {
                    continue;
                }
                if remote_version > local.version && local.gateway == remote {
                    file.blocks.insert(index, incoming);
                    remote_blocks += 1;
                    continue;
                }

                conflicted = true;
                match self.block_winner(op.file, index, local, incoming)? {
                    Winner::Remote => {
                        file.blocks.insert(index, incoming);
                        remote_blocks += 1;
                    }
                    Winner::Local => local_blocks += 1,
                }
            }

            if end > file.attrs.size {
                file.attrs.size = end;
            }
            if remote_blocks > 0 {
                file.attrs.modify_time = file.attrs.modify_time.max(op.new_attrs.modify_time);
                file.attrs.change_time = file.attrs.change_time.max(op.new_attrs.change_time);
            }
            Ok((conflicted, remote_blocks, local_blocks))
        })?;

        let Some((conflicted, remote_blocks, local_blocks)) = result else {
            return self.ignore_missing_dependency(&format!("file {}", op.file));
        };
        if !conflicted {
            return Ok(ResolveOutcome::Applied);
        }
        self.update_file_conflicts.fetch_add(1, Ordering::Relaxed);
        self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
        debug!(file = %op.file, remote_blocks, local_blocks, "write conflict resolved");
        Ok(ResolveOutcome::Merged {
            remote_blocks,
            local_blocks,
        })
    }

    fn block_winner(
        &self,
        file: ObjectId,
        index: u64,
        local: BlockVersion,
        remote: BlockVersion,
    ) -> ReplResult<Winner> {
        let remote_ref = BlockRef {
            file,
            index,
            version: remote,
        };
        let remote_stamp =
            self.blocks
                .load_stamp(&remote_ref)?
                .ok_or_else(|| ReplError::BlockMissing {
                    key: remote_ref.key(),
                })?;
        if local.is_hole() {
            return Ok(Winner::Remote);
        }
        let local_ref = BlockRef {
            file,
            index,
            version: local,
        };
        match self.blocks.load_stamp(&local_ref)? {
            Some(local_stamp) => Ok(pick_winner(local_stamp, remote_stamp)),
            None => Ok(Winner::Remote),
        }
    }
}
