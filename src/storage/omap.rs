//! Object map: virtual object id + transaction id to physical address.

use std::convert::TryInto;
use std::sync::Arc;

use tracing::debug;

use super::btree::codecs::{compare_omap_key, decode_omap_key, omap_key};
use super::btree::{BTree, BTreeOptions};
use crate::primitives::io::BlockSource;
use crate::types::checksum;
use crate::types::object::{ObjectHeader, ObjectType};
use crate::types::{ApfsError, Oid, Paddr, Result, Xid};

/// Translates a virtual object id, as of a transaction, into a physical address.
///
/// `Ok(None)` means no mapping exists at or before `xid`; errors are reserved for
/// failures reading the map itself.
pub trait NodeMapper: Send + Sync {
    /// Resolves `oid` as of `xid`.
    fn resolve(&self, oid: Oid, xid: Xid) -> Result<Option<Paddr>>;
}

/// Mapping has been deleted.
pub const OMAP_VAL_DELETED: u32 = 0x0000_0001;
/// Mapping is kept for a snapshot.
pub const OMAP_VAL_SAVED: u32 = 0x0000_0002;
/// Target object is encrypted.
pub const OMAP_VAL_ENCRYPTED: u32 = 0x0000_0004;
/// Target object has no object header.
pub const OMAP_VAL_NOHEADER: u32 = 0x0000_0008;

/// Length of an `omap_val_t`.
pub const OMAP_VAL_LEN: usize = 16;
/// Length of an `omap_key_t`.
pub const OMAP_KEY_LEN: usize = 16;

/// `omap_val_t`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OmapVal {
    /// `OMAP_VAL_*` flags.
    pub flags: u32,
    /// Size of the target object in bytes.
    pub size: u32,
    /// Physical address of the target object.
    pub paddr: Paddr,
}

impl OmapVal {
    /// Decodes a value read from an object map leaf.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < OMAP_VAL_LEN {
            return Err(ApfsError::Corruption("object map value truncated"));
        }
        Ok(Self {
            flags: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            paddr: Paddr(u64::from_le_bytes(bytes[8..16].try_into().unwrap())),
        })
    }

    /// Encodes the value.
    pub fn encode(&self) -> [u8; OMAP_VAL_LEN] {
        let mut out = [0u8; OMAP_VAL_LEN];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..16].copy_from_slice(&self.paddr.0.to_le_bytes());
        out
    }

    /// True when the mapping was deleted.
    pub fn is_deleted(&self) -> bool {
        self.flags & OMAP_VAL_DELETED != 0
    }
}

/// `omap_phys_t`, the object that anchors an object map.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OmapPhys {
    /// Object header.
    pub obj: ObjectHeader,
    /// Object map flags.
    pub flags: u32,
    /// Number of snapshots recorded.
    pub snap_count: u32,
    /// Object type of the mapping tree.
    pub tree_type: u32,
    /// Object type of the snapshot tree.
    pub snapshot_tree_type: u32,
    /// Physical address of the mapping tree root.
    pub tree_oid: Oid,
    /// Physical address of the snapshot tree root.
    pub snapshot_tree_oid: Oid,
    /// Most recent snapshot transaction.
    pub most_recent_snap: Xid,
    /// Lower bound of an in-progress revert.
    pub pending_revert_min: Xid,
    /// Upper bound of an in-progress revert.
    pub pending_revert_max: Xid,
}

/// Encoded length of `omap_phys_t`.
pub const OMAP_PHYS_LEN: usize = 88;

impl OmapPhys {
    /// Decodes the object map header from its block.
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < OMAP_PHYS_LEN {
            return Err(ApfsError::Corruption("object map block truncated"));
        }
        let u32_at = |at: usize| u32::from_le_bytes(block[at..at + 4].try_into().unwrap());
        let u64_at = |at: usize| u64::from_le_bytes(block[at..at + 8].try_into().unwrap());
        Ok(Self {
            obj: ObjectHeader::decode(block)?,
            flags: u32_at(32),
            snap_count: u32_at(36),
            tree_type: u32_at(40),
            snapshot_tree_type: u32_at(44),
            tree_oid: Oid(u64_at(48)),
            snapshot_tree_oid: Oid(u64_at(56)),
            most_recent_snap: Xid(u64_at(64)),
            pending_revert_min: Xid(u64_at(72)),
            pending_revert_max: Xid(u64_at(80)),
        })
    }

    /// Encodes the object map header into the start of `block`.
    pub fn encode(&self, block: &mut [u8]) -> Result<()> {
        if block.len() < OMAP_PHYS_LEN {
            return Err(ApfsError::Invalid("object map buffer too small"));
        }
        self.obj.encode(block)?;
        block[32..36].copy_from_slice(&self.flags.to_le_bytes());
        block[36..40].copy_from_slice(&self.snap_count.to_le_bytes());
        block[40..44].copy_from_slice(&self.tree_type.to_le_bytes());
        block[44..48].copy_from_slice(&self.snapshot_tree_type.to_le_bytes());
        block[48..56].copy_from_slice(&self.tree_oid.0.to_le_bytes());
        block[56..64].copy_from_slice(&self.snapshot_tree_oid.0.to_le_bytes());
        block[64..72].copy_from_slice(&self.most_recent_snap.0.to_le_bytes());
        block[72..80].copy_from_slice(&self.pending_revert_min.0.to_le_bytes());
        block[80..88].copy_from_slice(&self.pending_revert_max.0.to_le_bytes());
        Ok(())
    }
}

/// Object map backed by its physical mapping tree.
pub struct ObjectMap {
    phys: OmapPhys,
    tree: BTree,
}

impl ObjectMap {
    /// Reads the `omap_phys_t` at `paddr` and opens its mapping tree.
    pub fn open(source: Arc<dyn BlockSource>, paddr: Paddr, options: BTreeOptions) -> Result<Self> {
        let block = source.read_block_vec(paddr)?;
        if options.verify_checksums && !checksum::verify_object(&block) {
            return Err(ApfsError::Checksum { paddr });
        }
        let phys = OmapPhys::decode(&block)?;
        if options.check_object_type && phys.obj.object_type() != Some(ObjectType::Omap) {
            return Err(ApfsError::UnexpectedObject {
                paddr,
                expected: "object map",
                found: phys.obj.o_type,
            });
        }
        let tree = BTree::open(source, phys.tree_oid, phys.obj.xid, None, options)?;
        if !tree.info().is_physical() {
            return Err(ApfsError::Corruption("object map tree is not physical"));
        }
        if tree.key_len() as usize != OMAP_KEY_LEN || tree.val_len() as usize != OMAP_VAL_LEN {
            return Err(ApfsError::Corruption("object map tree has unexpected entry sizes"));
        }
        debug!(
            paddr = paddr.0,
            tree = phys.tree_oid.0,
            snapshots = phys.snap_count,
            "object map opened"
        );
        Ok(Self { phys, tree })
    }

    /// The decoded `omap_phys_t`.
    pub fn phys(&self) -> &OmapPhys {
        &self.phys
    }

    /// The mapping tree.
    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Returns the newest mapping of `oid` written at or before `xid`.
    pub fn lookup(&self, oid: Oid, xid: Xid) -> Result<Option<(Xid, OmapVal)>> {
        let key = omap_key(oid, xid);
        let Some(entry) = self.tree.lookup(&key, &compare_omap_key, false)? else {
            return Ok(None);
        };
        let Some((found_oid, found_xid)) = decode_omap_key(entry.key()) else {
            return Err(ApfsError::Corruption("object map key truncated"));
        };
        if found_oid != oid {
            return Ok(None);
        }
        Ok(Some((found_xid, OmapVal::decode(entry.val())?)))
    }
}

impl NodeMapper for ObjectMap {
    fn resolve(&self, oid: Oid, xid: Xid) -> Result<Option<Paddr>> {
        match self.lookup(oid, xid)? {
            Some((_, val)) if !val.is_deleted() => Ok(Some(val.paddr)),
            _ => Ok(None),
        }
    }
}
