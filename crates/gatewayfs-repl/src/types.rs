//! Object identifiers, gateway identifiers and object attributes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between an object's name and the gateway suffix appended on a
/// cross-gateway name conflict.
pub const SUFFIX_SEPARATOR: &str = "__gw__";

/// Attribute hint: the file is a symbolic link.
pub const HINT_SYMLINK: u32 = 1;
/// Attribute hint: the object belongs to a snapshot.
pub const HINT_SNAPSHOT: u32 = 1 << 1;
/// Attribute hint: the name carries a conflict suffix.
pub const HINT_NAME_SUFFIX: u32 = 1 << 2;
/// Attribute hint: local changes to the object are no longer replicated.
pub const HINT_NO_REPLICATION: u32 = 1 << 3;

/// Two-character gateway identity, stored as the big-endian `u16` of its
/// ASCII bytes. Id 0 is never a valid gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GatewayId(pub u16);

impl GatewayId {
    /// Marks block versions that were never written.
    pub const NONE: GatewayId = GatewayId(0);

    /// Builds an id from a two-character ASCII name.
    pub fn from_name(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.len() != 2 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        Some(GatewayId(u16::from_be_bytes([bytes[0], bytes[1]])))
    }

    /// The two-character name.
    pub fn name(&self) -> String {
        self.0
            .to_be_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect()
    }

    /// Raw numeric id.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether an object is a directory or a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// A directory.
    Directory,
    /// A regular file (or symlink).
    File,
}

/// Globally unique object identifier: a 128-bit id scoped by the gateway that
/// created the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Per-creator unique id.
    pub id: u128,
    /// Gateway that created the object.
    pub creator: GatewayId,
    /// Directory or file.
    pub kind: ObjectKind,
}

impl ObjectId {
    /// Creates an object id.
    pub fn new(id: u128, creator: GatewayId, kind: ObjectKind) -> Self {
        Self { id, creator, kind }
    }

    /// True for directories.
    pub fn is_directory(&self) -> bool {
        self.kind == ObjectKind::Directory
    }

    /// Key used for this object's znode.
    pub fn key(&self) -> String {
        let tag = match self.kind {
            ObjectKind::Directory => 'd',
            ObjectKind::File => 'f',
        };
        format!("{}{:032x}-{:04x}", tag, self.id, self.creator.0)
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id
            .cmp(&other.id)
            .then(self.creator.cmp(&other.creator))
            .then((self.kind as u8).cmp(&(other.kind as u8)))
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// POSIX-like attributes plus replication hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    /// Size in bytes.
    pub size: u64,
    /// Permission and type bits.
    pub mode: u32,
    /// Link count.
    pub nlinks: u32,
    /// Creation time (ms).
    pub create_time: u64,
    /// Last data modification (ms).
    pub modify_time: u64,
    /// Last attribute change (ms).
    pub change_time: u64,
    /// Last access (ms).
    pub access_time: u64,
    /// `HINT_*` bits.
    pub hints: u32,
}

impl ObjectAttributes {
    /// Returns true if `hint` is set.
    pub fn has_hint(&self, hint: u32) -> bool {
        self.hints & hint != 0
    }

    /// Sets `hint`.
    pub fn set_hint(&mut self, hint: u32) {
        self.hints |= hint;
    }

    /// True once local changes to the object stop replicating.
    pub fn is_no_replication(&self) -> bool {
        self.has_hint(HINT_NO_REPLICATION)
    }

    /// True when the object was renamed to resolve a name conflict.
    pub fn is_suffixed_name(&self) -> bool {
        self.has_hint(HINT_NAME_SUFFIX)
    }
}

/// Appends the conflict suffix of `creator` to `name`.
pub fn suffixed_name(name: &str, creator: GatewayId) -> String {
    format!("{}{}{}", name, SUFFIX_SEPARATOR, creator.name())
}

/// True when `name` splits into exactly two parts on the suffix separator.
pub fn is_suffixed_name(name: &str) -> bool {
    name.split(SUFFIX_SEPARATOR).count() == 2
}
