//! On-disk layout of B-tree node blocks (`btree_node_phys_t`) and the tree info footer.

use std::convert::TryInto;

use crate::types::object::{ObjectHeader, OBJ_HDR_LEN};
use crate::types::{ApfsError, Result};

/// Offset of the first byte after the node header (`btn_data`).
pub const NODE_HEADER_LEN: usize = 56;

const FLAGS_OFFSET: usize = OBJ_HDR_LEN;
const LEVEL_OFFSET: usize = 34;
const NKEYS_OFFSET: usize = 36;
const TABLE_SPACE_OFFSET: usize = 40;
const FREE_SPACE_OFFSET: usize = 44;
const KEY_FREE_LIST_OFFSET: usize = 48;
const VAL_FREE_LIST_OFFSET: usize = 52;

/// Size of the `btree_info_t` footer stored at the end of every root node.
pub const BTREE_INFO_LEN: usize = 40;

/// Size of a fixed-layout table entry (`kvoff_t`).
pub const KVOFF_LEN: usize = 4;
/// Size of a variable-layout table entry (`kvloc_t`).
pub const KVLOC_LEN: usize = 8;
/// Value offset marking an entry without a value.
pub const KVOFF_INVALID: u16 = 0xffff;

/// Child pointer size in non-hashed internal nodes.
pub const CHILD_OID_LEN: usize = 8;
/// Child pointer size in hashed internal nodes (`btn_index_node_val_t`).
pub const HASHED_CHILD_LEN: usize = CHILD_OID_LEN + 32;

/// Node is the root of its tree.
pub const BTNODE_ROOT: u16 = 0x0001;
/// Node is a leaf.
pub const BTNODE_LEAF: u16 = 0x0002;
/// Node uses the fixed key/value table layout.
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
/// Internal node values carry a child hash.
pub const BTNODE_HASHED: u16 = 0x0008;
/// Node was stored without an object header.
pub const BTNODE_NOHEADER: u16 = 0x0010;
/// Transient in-memory flag; never valid on disk.
pub const BTNODE_CHECK_KOFF_INVAL: u16 = 0x8000;

/// Keys are 64-bit integers (fixed layout).
pub const BTREE_UINT64_KEYS: u32 = 0x0000_0001;
/// Tree was populated in key order.
pub const BTREE_SEQUENTIAL_INSERT: u32 = 0x0000_0002;
/// Entries may lack a value.
pub const BTREE_ALLOW_GHOSTS: u32 = 0x0000_0004;
/// Nodes live in the ephemeral area.
pub const BTREE_EPHEMERAL: u32 = 0x0000_0008;
/// Child pointers are physical addresses.
pub const BTREE_PHYSICAL: u32 = 0x0000_0010;
/// Tree is never persisted.
pub const BTREE_NONPERSISTENT: u32 = 0x0000_0020;
/// Keys and values are not 8-byte aligned.
pub const BTREE_KV_NONALIGNED: u32 = 0x0000_0040;
/// Internal nodes carry child hashes.
pub const BTREE_HASHED: u32 = 0x0000_0080;
/// Nodes are stored without object headers.
pub const BTREE_NOHEADER: u32 = 0x0000_0100;

/// `nloc_t`: an (offset, length) pair inside the node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Nloc {
    /// Offset relative to the area the location belongs to.
    pub off: u16,
    /// Length in bytes.
    pub len: u16,
}

impl Nloc {
    fn read(block: &[u8], at: usize) -> Self {
        Self {
            off: read_u16(block, at),
            len: read_u16(block, at + 2),
        }
    }

    fn write(&self, block: &mut [u8], at: usize) {
        write_u16(block, at, self.off);
        write_u16(block, at + 2, self.len);
    }
}

/// Header metadata decoded from the first 56 bytes of a node block.
#[derive(Clone, Debug)]
pub struct Header {
    /// Object header shared with every APFS object.
    pub obj: ObjectHeader,
    /// `BTNODE_*` flags.
    pub flags: u16,
    /// Distance from the leaves; zero for leaf nodes.
    pub level: u16,
    /// Number of entries in the table of contents.
    pub nkeys: u32,
    /// Location of the table of contents, relative to `btn_data`.
    pub table_space: Nloc,
    /// Free gap between keys and values.
    pub free_space: Nloc,
    /// Head of the key free list.
    pub key_free_list: Nloc,
    /// Head of the value free list.
    pub val_free_list: Nloc,
}

impl Header {
    /// Decode and sanity check the header of `block`.
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < NODE_HEADER_LEN {
            return Err(ApfsError::Corruption("node block shorter than header"));
        }
        let obj = ObjectHeader::decode(block)?;
        let flags = read_u16(block, FLAGS_OFFSET);
        let level = read_u16(block, LEVEL_OFFSET);
        let nkeys = read_u32(block, NKEYS_OFFSET);
        let table_space = Nloc::read(block, TABLE_SPACE_OFFSET);
        let free_space = Nloc::read(block, FREE_SPACE_OFFSET);
        let key_free_list = Nloc::read(block, KEY_FREE_LIST_OFFSET);
        let val_free_list = Nloc::read(block, VAL_FREE_LIST_OFFSET);

        if flags & BTNODE_CHECK_KOFF_INVAL != 0 {
            return Err(ApfsError::Corruption("node carries in-memory only flag"));
        }
        let is_leaf = flags & BTNODE_LEAF != 0;
        if is_leaf != (level == 0) {
            return Err(ApfsError::Corruption("node leaf flag disagrees with level"));
        }
        let header = Self {
            obj,
            flags,
            level,
            nkeys,
            table_space,
            free_space,
            key_free_list,
            val_free_list,
        };
        if header.keys_start() > header.vals_end(block.len()) {
            return Err(ApfsError::Corruption(
                "node table of contents overlaps value area",
            ));
        }
        let entry_len = if header.is_fixed() { KVOFF_LEN } else { KVLOC_LEN };
        let toc_bytes = (nkeys as usize)
            .checked_mul(entry_len)
            .ok_or(ApfsError::Corruption("node entry count overflows"))?;
        if toc_bytes > table_space.len as usize {
            return Err(ApfsError::Corruption(
                "node entry count exceeds table of contents",
            ));
        }
        Ok(header)
    }

    /// Writes the header into the first 56 bytes of `block`.
    pub fn encode(&self, block: &mut [u8]) -> Result<()> {
        if block.len() < NODE_HEADER_LEN {
            return Err(ApfsError::Invalid("node buffer shorter than header"));
        }
        self.obj.encode(block)?;
        write_u16(block, FLAGS_OFFSET, self.flags);
        write_u16(block, LEVEL_OFFSET, self.level);
        write_u32(block, NKEYS_OFFSET, self.nkeys);
        self.table_space.write(block, TABLE_SPACE_OFFSET);
        self.free_space.write(block, FREE_SPACE_OFFSET);
        self.key_free_list.write(block, KEY_FREE_LIST_OFFSET);
        self.val_free_list.write(block, VAL_FREE_LIST_OFFSET);
        Ok(())
    }

    /// True for the root node of a tree.
    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    /// True for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    /// True when entries use the fixed `kvoff_t` table.
    pub fn is_fixed(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    /// True when internal values carry child hashes.
    pub fn is_hashed(&self) -> bool {
        self.flags & BTNODE_HASHED != 0
    }

    /// Absolute offset of the table of contents.
    pub fn toc_start(&self) -> usize {
        NODE_HEADER_LEN + self.table_space.off as usize
    }

    /// Absolute offset of the key area (directly after the table of contents).
    pub fn keys_start(&self) -> usize {
        self.toc_start() + self.table_space.len as usize
    }

    /// Absolute offset one past the value area; values are addressed backwards from here.
    pub fn vals_end(&self, block_len: usize) -> usize {
        if self.is_root() {
            block_len.saturating_sub(BTREE_INFO_LEN)
        } else {
            block_len
        }
    }
}

/// `btree_info_t`: static tree parameters plus counters, stored at the tail of the root node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BTreeInfo {
    /// `BTREE_*` flags.
    pub flags: u32,
    /// Size of every node block.
    pub node_size: u32,
    /// Key size for fixed layouts, zero otherwise.
    pub key_size: u32,
    /// Value size for fixed layouts, zero otherwise.
    pub val_size: u32,
    /// Longest key ever stored.
    pub longest_key: u32,
    /// Longest value ever stored.
    pub longest_val: u32,
    /// Number of leaf entries.
    pub key_count: u64,
    /// Number of nodes.
    pub node_count: u64,
}

impl BTreeInfo {
    /// Reads the footer from the last 40 bytes of a root block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < NODE_HEADER_LEN + BTREE_INFO_LEN {
            return Err(ApfsError::Corruption("root block too small for tree info"));
        }
        let at = block.len() - BTREE_INFO_LEN;
        let info = Self {
            flags: read_u32(block, at),
            node_size: read_u32(block, at + 4),
            key_size: read_u32(block, at + 8),
            val_size: read_u32(block, at + 12),
            longest_key: read_u32(block, at + 16),
            longest_val: read_u32(block, at + 20),
            key_count: read_u64(block, at + 24),
            node_count: read_u64(block, at + 32),
        };
        if info.node_size as usize != block.len() {
            return Err(ApfsError::Corruption("tree info node size disagrees with block"));
        }
        Ok(info)
    }

    /// Writes the footer into the last 40 bytes of `block`.
    pub fn encode(&self, block: &mut [u8]) -> Result<()> {
        if block.len() < NODE_HEADER_LEN + BTREE_INFO_LEN {
            return Err(ApfsError::Invalid("root buffer too small for tree info"));
        }
        let at = block.len() - BTREE_INFO_LEN;
        write_u32(block, at, self.flags);
        write_u32(block, at + 4, self.node_size);
        write_u32(block, at + 8, self.key_size);
        write_u32(block, at + 12, self.val_size);
        write_u32(block, at + 16, self.longest_key);
        write_u32(block, at + 20, self.longest_val);
        write_u64(block, at + 24, self.key_count);
        write_u64(block, at + 32, self.node_count);
        Ok(())
    }

    /// Child pointers are physical addresses rather than virtual object ids.
    pub fn is_physical(&self) -> bool {
        self.flags & BTREE_PHYSICAL != 0
    }

    /// Internal nodes carry child hashes.
    pub fn is_hashed(&self) -> bool {
        self.flags & BTREE_HASHED != 0
    }

    /// Leaf entries may have no value.
    pub fn allows_ghosts(&self) -> bool {
        self.flags & BTREE_ALLOW_GHOSTS != 0
    }
}

/// Reads the `kvoff_t` at table slot `idx`.
pub(crate) fn read_kvoff(block: &[u8], toc_start: usize, idx: usize) -> Result<(u16, u16)> {
    let at = toc_start + idx * KVOFF_LEN;
    let entry = block
        .get(at..at + KVOFF_LEN)
        .ok_or(ApfsError::Corruption("kvoff entry beyond block"))?;
    Ok((read_u16(entry, 0), read_u16(entry, 2)))
}

/// Reads the `kvloc_t` at table slot `idx` as (key, value) locations.
pub(crate) fn read_kvloc(block: &[u8], toc_start: usize, idx: usize) -> Result<(Nloc, Nloc)> {
    let at = toc_start + idx * KVLOC_LEN;
    let entry = block
        .get(at..at + KVLOC_LEN)
        .ok_or(ApfsError::Corruption("kvloc entry beyond block"))?;
    Ok((Nloc::read(entry, 0), Nloc::read(entry, 4)))
}

/// Writes a `kvoff_t` at table slot `idx`.
pub fn write_kvoff(block: &mut [u8], toc_start: usize, idx: usize, k: u16, v: u16) {
    let at = toc_start + idx * KVOFF_LEN;
    write_u16(block, at, k);
    write_u16(block, at + 2, v);
}

/// Writes a `kvloc_t` at table slot `idx`.
pub fn write_kvloc(block: &mut [u8], toc_start: usize, idx: usize, k: Nloc, v: Nloc) {
    let at = toc_start + idx * KVLOC_LEN;
    k.write(block, at);
    v.write(block, at + 4);
}

#[inline]
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

#[inline]
fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

#[inline]
fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
