//! Volume namespace: directories and files persisted as znodes through the
//! coordination client.
//!
//! Layout in the coordination store:
//!
//! ```text
//! /<volume>                    VolumeInfo
//! /<volume>/objects            (empty)
//! /<volume>/objects/<oid key>  ObjectNode (directory with entries, or file
//!                              with block versions)
//! ```
//!
//! Mutations build a metadata transaction over every touched znode and
//! submit it through the client, so they inherit its journal durability and
//! per-path commit ordering. The in-memory object cache is updated only
//! after the submit is accepted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use gatewayfs_meta::types::now_millis;
use gatewayfs_meta::{CoordinationClient, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::block::BlockVersion;
use crate::error::{ReplError, ReplResult};
use crate::types::{
    suffixed_name, GatewayId, ObjectAttributes, ObjectId, HINT_NAME_SUFFIX, HINT_NO_REPLICATION,
};

/// Hint bits owned by the local gateway; remote attribute updates keep them.
const LOCAL_HINTS: u32 = HINT_NAME_SUFFIX | HINT_NO_REPLICATION;

/// Persistent description of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Root directory.
    pub root: ObjectId,
    /// Creation time (ms).
    pub create_time: u64,
}

/// A directory and its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMeta {
    /// The directory.
    pub oid: ObjectId,
    /// Containing directory; `None` for a volume root.
    pub parent: Option<ObjectId>,
    /// Name in the parent.
    pub name: String,
    /// Attributes.
    pub attrs: ObjectAttributes,
    /// Children by name.
    pub entries: BTreeMap<String, ObjectId>,
}

/// A file and the versions of its blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// The file.
    pub oid: ObjectId,
    /// Containing directory.
    pub parent: ObjectId,
    /// Name in the parent.
    pub name: String,
    /// Attributes.
    pub attrs: ObjectAttributes,
    /// Block size in bytes.
    pub block_size: u32,
    /// Versions of the written blocks by block number. Blocks never
    /// written are holes and have no entry.
    pub blocks: BTreeMap<u64, BlockVersion>,
}

impl FileMeta {
    /// Version of block `index`, [`BlockVersion::HOLE`] if never written.
    pub fn block(&self, index: u64) -> BlockVersion {
        self.blocks
            .get(&index)
            .copied()
            .unwrap_or(BlockVersion::HOLE)
    }
}

/// One persisted namespace object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectNode {
    /// A directory.
    Directory(DirectoryMeta),
    /// A file.
    File(FileMeta),
}

impl ObjectNode {
    /// Identifier of the object.
    pub fn oid(&self) -> ObjectId {
        match self {
            ObjectNode::Directory(d) => d.oid,
            ObjectNode::File(f) => f.oid,
        }
    }

    /// Attributes of the object.
    pub fn attrs(&self) -> &ObjectAttributes {
        match self {
            ObjectNode::Directory(d) => &d.attrs,
            ObjectNode::File(f) => &f.attrs,
        }
    }

    fn attrs_mut(&mut self) -> &mut ObjectAttributes {
        match self {
            ObjectNode::Directory(d) => &mut d.attrs,
            ObjectNode::File(f) => &mut f.attrs,
        }
    }

    fn set_location(&mut self, parent: ObjectId, name: &str) {
        match self {
            ObjectNode::Directory(d) => {
                d.parent = Some(parent);
                d.name = name.to_string();
            }
            ObjectNode::File(f) => {
                f.parent = parent;
                f.name = name.to_string();
            }
        }
    }
}

/// Result of adding a child to a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The child was added, possibly under a suffixed name.
    Created {
        /// Name the child was stored under.
        name: String,
        /// True when the conflict suffix was appended.
        suffixed: bool,
    },
    /// The same object is already present in the directory.
    AlreadyExists {
        /// Name it is stored under.
        name: String,
    },
}

/// Result of removing a child from a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The entry was removed and the object deleted.
    Removed,
    /// No entry with that name refers to the expected object.
    NotFound,
    /// The entry is a directory that still has children.
    NotEmpty,
}

enum Write {
    Create(ObjectId, ObjectNode),
    Update(ObjectId, ObjectNode),
    Delete(ObjectId),
}

/// One volume's namespace on this gateway.
pub struct Volume {
    info: VolumeInfo,
    local: GatewayId,
    client: Arc<CoordinationClient>,
    objects: Mutex<HashMap<ObjectId, ObjectNode>>,
}

impl Volume {
    /// Creates the volume znodes and its root directory.
    pub fn create(
        client: Arc<CoordinationClient>,
        local: GatewayId,
        name: &str,
        root: ObjectId,
        attrs: ObjectAttributes,
    ) -> ReplResult<Self> {
        check_volume_name(name)?;
        let volume_path = format!("/{}", name);
        if client.check_exists(&volume_path)? {
            return Err(ReplError::VolumeExists(name.to_string()));
        }
        if !root.is_directory() {
            return Err(ReplError::NotADirectory { oid: root });
        }

        let info = VolumeInfo {
            name: name.to_string(),
            root,
            create_time: now_millis(),
        };
        client.create_recursive(&volume_path, &bincode::serialize(&info)?)?;
        client.create_recursive(&format!("{}/objects", volume_path), b"")?;

        let volume = Self::with_info(client, local, info);
        let root_dir = ObjectNode::Directory(DirectoryMeta {
            oid: root,
            parent: None,
            name: String::new(),
            attrs,
            entries: BTreeMap::new(),
        });
        let mut objects = volume.objects.lock();
        volume.apply(&mut objects, vec![Write::Create(root, root_dir)])?;
        drop(objects);
        info!(volume = %name, root = %root, "volume created");
        Ok(volume)
    }

    /// Opens an existing volume, or returns `None` if it does not exist.
    pub fn open(
        client: Arc<CoordinationClient>,
        local: GatewayId,
        name: &str,
    ) -> ReplResult<Option<Self>> {
        check_volume_name(name)?;
        let Some(bytes) = client.try_read(&format!("/{}", name))? else {
            return Ok(None);
        };
        let info: VolumeInfo = bincode::deserialize(&bytes)?;
        Ok(Some(Self::with_info(client, local, info)))
    }

    fn with_info(client: Arc<CoordinationClient>, local: GatewayId, info: VolumeInfo) -> Self {
        Self {
            info,
            local,
            client,
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Volume name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Root directory.
    pub fn root(&self) -> ObjectId {
        self.info.root
    }

    /// Persistent volume description.
    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    /// Gateway that owns this replica.
    pub fn local_gateway(&self) -> GatewayId {
        self.local
    }

    /// Returns the object, if it exists.
    pub fn object(&self, oid: ObjectId) -> ReplResult<Option<ObjectNode>> {
        let mut objects = self.objects.lock();
        Ok(self.load(&mut objects, oid)?.cloned())
    }

    /// Returns the directory, if it exists.
    pub fn directory(&self, oid: ObjectId) -> ReplResult<Option<DirectoryMeta>> {
        match self.object(oid)? {
            Some(ObjectNode::Directory(d)) => Ok(Some(d)),
            Some(ObjectNode::File(_)) => Err(ReplError::NotADirectory { oid }),
            None => Ok(None),
        }
    }

    /// Returns the file, if it exists.
    pub fn file(&self, oid: ObjectId) -> ReplResult<Option<FileMeta>> {
        match self.object(oid)? {
            Some(ObjectNode::File(f)) => Ok(Some(f)),
            _ => Ok(None),
        }
    }

    /// Returns true if the object exists.
    pub fn exists(&self, oid: ObjectId) -> ReplResult<bool> {
        Ok(self.object(oid)?.is_some())
    }

    /// Looks up `name` in `dir`.
    pub fn lookup(&self, dir: ObjectId, name: &str) -> ReplResult<Option<ObjectId>> {
        Ok(self
            .directory(dir)?
            .and_then(|d| d.entries.get(name).copied()))
    }

    /// Returns true if `dir` maps `name` to `oid`.
    pub fn has_child(&self, dir: ObjectId, name: &str, oid: ObjectId) -> ReplResult<bool> {
        Ok(self.lookup(dir, name)? == Some(oid))
    }

    /// Adds a new subdirectory.
    pub fn create_child_dir(
        &self,
        parent: ObjectId,
        name: &str,
        oid: ObjectId,
        attrs: ObjectAttributes,
    ) -> ReplResult<CreateOutcome> {
        let node = ObjectNode::Directory(DirectoryMeta {
            oid,
            parent: Some(parent),
            name: name.to_string(),
            attrs,
            entries: BTreeMap::new(),
        });
        self.create_child(parent, name, node)
    }

    /// Adds a new empty file.
    pub fn create_child_file(
        &self,
        parent: ObjectId,
        name: &str,
        oid: ObjectId,
        attrs: ObjectAttributes,
        block_size: u32,
    ) -> ReplResult<CreateOutcome> {
        let node = ObjectNode::File(FileMeta {
            oid,
            parent,
            name: name.to_string(),
            attrs,
            block_size,
            blocks: BTreeMap::new(),
        });
        self.create_child(parent, name, node)
    }

    /// Adds `node` to `parent` under `name`. When the name is taken and the
    /// new object was created by another gateway, it is stored under the
    /// suffixed name instead; a local duplicate is refused.
    fn create_child(
        &self,
        parent: ObjectId,
        name: &str,
        mut node: ObjectNode,
    ) -> ReplResult<CreateOutcome> {
        let oid = node.oid();
        let mut objects = self.objects.lock();
        let mut dir = self.load_dir(&mut objects, parent)?;

        if let Some((existing, _)) = dir.entries.iter().find(|(_, child)| **child == oid) {
            return Ok(CreateOutcome::AlreadyExists {
                name: existing.clone(),
            });
        }

        let mut stored_name = name.to_string();
        let suffixed = dir.entries.contains_key(name);
        if suffixed {
            if oid.creator == self.local {
                return Err(ReplError::NameConflict {
                    parent,
                    name: name.to_string(),
                });
            }
            stored_name = suffixed_name(name, oid.creator);
            if dir.entries.contains_key(&stored_name) {
                return Err(ReplError::NameConflict {
                    parent,
                    name: stored_name,
                });
            }
            node.attrs_mut().set_hint(HINT_NAME_SUFFIX);
        }
        node.set_location(parent, &stored_name);
        dir.entries.insert(stored_name.clone(), oid);
        if oid.is_directory() {
            dir.attrs.nlinks = dir.attrs.nlinks.saturating_add(1);
        }

        self.apply(
            &mut objects,
            vec![
                Write::Create(oid, node),
                Write::Update(parent, ObjectNode::Directory(dir)),
            ],
        )?;
        debug!(volume = %self.info.name, parent = %parent, name = %stored_name, oid = %oid, "child created");
        Ok(CreateOutcome::Created {
            name: stored_name,
            suffixed,
        })
    }

    /// Removes `name` from `parent` if it refers to `expected`, deleting the
    /// object. Directories must be empty.
    pub fn remove_child(
        &self,
        parent: ObjectId,
        name: &str,
        expected: ObjectId,
    ) -> ReplResult<RemoveOutcome> {
        let mut objects = self.objects.lock();
        let mut dir = self.load_dir(&mut objects, parent)?;
        if dir.entries.get(name) != Some(&expected) {
            return Ok(RemoveOutcome::NotFound);
        }
        if let Some(ObjectNode::Directory(child)) = self.load(&mut objects, expected)? {
            if !child.entries.is_empty() {
                return Ok(RemoveOutcome::NotEmpty);
            }
            dir.attrs.nlinks = dir.attrs.nlinks.saturating_sub(1);
        }
        dir.entries.remove(name);
        self.apply(
            &mut objects,
            vec![
                Write::Delete(expected),
                Write::Update(parent, ObjectNode::Directory(dir)),
            ],
        )?;
        debug!(volume = %self.info.name, parent = %parent, name = %name, "child removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Moves the entry `src_name` of `src_dir` to `dst_name` in `dst_dir`,
    /// replacing (and deleting) any object already under the destination
    /// name. Returns the moved object.
    pub fn rename_child(
        &self,
        src_dir: ObjectId,
        src_name: &str,
        dst_dir: ObjectId,
        dst_name: &str,
    ) -> ReplResult<ObjectId> {
        let mut objects = self.objects.lock();
        let mut src = self.load_dir(&mut objects, src_dir)?;
        let moved = src
            .entries
            .get(src_name)
            .copied()
            .ok_or(ReplError::ObjectNotFound { oid: src_dir })?;
        let mut moved_node = self
            .load(&mut objects, moved)?
            .cloned()
            .ok_or(ReplError::ObjectNotFound { oid: moved })?;

        let same_dir = src_dir == dst_dir;
        let mut dst = if same_dir {
            None
        } else {
            Some(self.load_dir(&mut objects, dst_dir)?)
        };

        let mut writes = Vec::new();
        let replaced = match &dst {
            Some(d) => d.entries.get(dst_name).copied(),
            None => src.entries.get(dst_name).copied(),
        };
        if let Some(replaced) = replaced.filter(|r| *r != moved) {
            if let Some(ObjectNode::Directory(victim)) = self.load(&mut objects, replaced)? {
                if !victim.entries.is_empty() {
                    return Err(ReplError::NotEmpty { oid: replaced });
                }
            }
            writes.push(Write::Delete(replaced));
        }

        src.entries.remove(src_name);
        let target = dst.as_mut().unwrap_or(&mut src);
        target.entries.insert(dst_name.to_string(), moved);
        if moved.is_directory() && !same_dir {
            src.attrs.nlinks = src.attrs.nlinks.saturating_sub(1);
            if let Some(d) = dst.as_mut() {
                d.attrs.nlinks = d.attrs.nlinks.saturating_add(1);
            }
        }
        moved_node.set_location(dst_dir, dst_name);

        writes.push(Write::Update(src_dir, ObjectNode::Directory(src)));
        if let Some(d) = dst {
            writes.push(Write::Update(dst_dir, ObjectNode::Directory(d)));
        }
        writes.push(Write::Update(moved, moved_node));
        self.apply(&mut objects, writes)?;
        debug!(volume = %self.info.name, oid = %moved, "{} -> {}", src_name, dst_name);
        Ok(moved)
    }

    /// Replaces the attributes of `oid`, keeping local hint bits. Returns
    /// false when the object does not exist.
    pub fn set_attributes(&self, oid: ObjectId, attrs: &ObjectAttributes) -> ReplResult<bool> {
        self.modify(oid, |node| {
            let current = node.attrs_mut();
            let hints = (current.hints & LOCAL_HINTS) | attrs.hints;
            *current = attrs.clone();
            current.hints = hints;
            Ok(())
        })
        .map(|r| r.is_some())
    }

    /// Stops replicating local changes to `oid` and, for a directory, to
    /// everything beneath it. Returns the number of objects marked.
    pub fn set_no_replication(&self, oid: ObjectId) -> ReplResult<usize> {
        let mut objects = self.objects.lock();
        let mut pending = vec![oid];
        let mut writes = Vec::new();
        while let Some(next) = pending.pop() {
            let Some(node) = self.load(&mut objects, next)? else {
                continue;
            };
            let mut node = node.clone();
            if let ObjectNode::Directory(d) = &node {
                pending.extend(d.entries.values().copied());
            }
            if !node.attrs().is_no_replication() {
                node.attrs_mut().set_hint(HINT_NO_REPLICATION);
                writes.push(Write::Update(next, node));
            }
        }
        let marked = writes.len();
        self.apply(&mut objects, writes)?;
        info!(volume = %self.info.name, oid = %oid, marked, "replication disabled");
        Ok(marked)
    }

    /// Runs `f` on a copy of the file and persists the result if `f`
    /// succeeds. Returns `None` if the file does not exist.
    pub fn modify_file<T, F>(&self, oid: ObjectId, f: F) -> ReplResult<Option<T>>
    where
        F: FnOnce(&mut FileMeta) -> ReplResult<T>,
    {
        self.modify(oid, |node| match node {
            ObjectNode::File(file) => f(file),
            ObjectNode::Directory(_) => Err(ReplError::InvalidMessage {
                msg: format!("{} is a directory", oid),
            }),
        })
    }

    fn modify<T, F>(&self, oid: ObjectId, f: F) -> ReplResult<Option<T>>
    where
        F: FnOnce(&mut ObjectNode) -> ReplResult<T>,
    {
        let mut objects = self.objects.lock();
        let Some(node) = self.load(&mut objects, oid)? else {
            return Ok(None);
        };
        let mut node = node.clone();
        let result = f(&mut node)?;
        self.apply(&mut objects, vec![Write::Update(oid, node)])?;
        Ok(Some(result))
    }

    fn object_path(&self, oid: ObjectId) -> String {
        format!("/{}/objects/{}", self.info.name, oid.key())
    }

    fn load<'a>(
        &self,
        objects: &'a mut HashMap<ObjectId, ObjectNode>,
        oid: ObjectId,
    ) -> ReplResult<Option<&'a ObjectNode>> {
        if !objects.contains_key(&oid) {
            match self.client.try_read(&self.object_path(oid))? {
                Some(bytes) => {
                    let node: ObjectNode = bincode::deserialize(&bytes)?;
                    objects.insert(oid, node);
                }
                None => return Ok(None),
            }
        }
        Ok(objects.get(&oid))
    }

    fn load_dir(
        &self,
        objects: &mut HashMap<ObjectId, ObjectNode>,
        oid: ObjectId,
    ) -> ReplResult<DirectoryMeta> {
        match self.load(objects, oid)? {
            Some(ObjectNode::Directory(d)) => Ok(d.clone()),
            Some(ObjectNode::File(_)) => Err(ReplError::NotADirectory { oid }),
            None => Err(ReplError::ObjectNotFound { oid }),
        }
    }

    /// Submits `writes` as one transaction, then updates the cache.
    fn apply(
        &self,
        objects: &mut HashMap<ObjectId, ObjectNode>,
        writes: Vec<Write>,
    ) -> ReplResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut txn = self.client.new_transaction();
        if let Err(e) = self.stage(&mut txn, &writes) {
            txn.discard();
            return Err(e);
        }
        self.client.submit_transaction(txn)?;

        for write in writes {
            match write {
                Write::Create(oid, node) | Write::Update(oid, node) => {
                    objects.insert(oid, node);
                }
                Write::Delete(oid) => {
                    objects.remove(&oid);
                }
            }
        }
        Ok(())
    }

    fn stage(&self, txn: &mut Transaction, writes: &[Write]) -> ReplResult<()> {
        for write in writes {
            match write {
                Write::Create(oid, node) => {
                    txn.create(&self.object_path(*oid), &bincode::serialize(node)?)?
                }
                Write::Update(oid, node) => {
                    txn.update(&self.object_path(*oid), &bincode::serialize(node)?)?
                }
                Write::Delete(oid) => txn.delete(&self.object_path(*oid))?,
            }
        }
        txn.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("info", &self.info)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

fn check_volume_name(name: &str) -> ReplResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(ReplError::InvalidMessage {
            msg: format!("bad volume name {:?}", name),
        });
    }
    Ok(())
}

/// Volumes known to this gateway, opened lazily.
pub struct VolumeRegistry {
    client: Arc<CoordinationClient>,
    local: GatewayId,
    volumes: Mutex<HashMap<String, Arc<Volume>>>,
}

impl VolumeRegistry {
    /// Creates a registry for the gateway `local`.
    pub fn new(client: Arc<CoordinationClient>, local: GatewayId) -> Self {
        Self {
            client,
            local,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// The coordination client volumes persist through.
    pub fn client(&self) -> &Arc<CoordinationClient> {
        &self.client
    }

    /// Gateway that owns this replica.
    pub fn local_gateway(&self) -> GatewayId {
        self.local
    }

    /// Returns the named volume, opening it on first use.
    pub fn get(&self, name: &str) -> ReplResult<Option<Arc<Volume>>> {
        let mut volumes = self.volumes.lock();
        if let Some(volume) = volumes.get(name) {
            return Ok(Some(volume.clone()));
        }
        match Volume::open(self.client.clone(), self.local, name)? {
            Some(volume) => {
                let volume = Arc::new(volume);
                volumes.insert(name.to_string(), volume.clone());
                Ok(Some(volume))
            }
            None => Ok(None),
        }
    }

    /// Creates a volume.
    pub fn create(
        &self,
        name: &str,
        root: ObjectId,
        attrs: ObjectAttributes,
    ) -> ReplResult<Arc<Volume>> {
        let mut volumes = self.volumes.lock();
        if volumes.contains_key(name) {
            return Err(ReplError::VolumeExists(name.to_string()));
        }
        let volume = Arc::new(Volume::create(
            self.client.clone(),
            self.local,
            name,
            root,
            attrs,
        )?);
        volumes.insert(name.to_string(), volume.clone());
        Ok(volume)
    }
}

impl std::fmt::Debug for VolumeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeRegistry")
            .field("local", &self.local)
            .field("volumes", &self.volumes.lock().len())
            .finish()
    }
}
