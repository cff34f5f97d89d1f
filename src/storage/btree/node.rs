use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use super::page::{self, BTreeInfo, Header};
use crate::types::{ApfsError, Oid, Paddr, Result, Xid};

/// How a node's table of contents locates its keys and values.
///
/// Chosen once at decode time from `BTNODE_FIXED_KV_SIZE`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeLayout {
    /// `kvoff_t` table; every key and every value has the same size.
    Fixed {
        /// Size of every key.
        key_len: usize,
        /// Size of every value in this node (child pointer size for internal nodes).
        val_len: usize,
    },
    /// `kvloc_t` table with explicit lengths.
    Variable,
}

/// Immutable decoded view over one B-tree node block.
pub struct Node {
    block: Box<[u8]>,
    header: Header,
    layout: NodeLayout,
    paddr: Paddr,
    parent: Option<Arc<Node>>,
    parent_index: u32,
}

impl Node {
    /// Decodes `block`, read from `paddr`, as a node of a tree described by `info`.
    ///
    /// `parent` and `parent_index` record where the node was reached from; they are
    /// what an iterator climbs when it runs off the end of a leaf.
    pub fn decode(
        block: Vec<u8>,
        paddr: Paddr,
        parent: Option<Arc<Node>>,
        parent_index: u32,
        info: &BTreeInfo,
    ) -> Result<Self> {
        let header = Header::parse(&block)?;
        let layout = if header.is_fixed() {
            let key_len = info.key_size as usize;
            let val_len = if header.is_leaf() {
                info.val_size as usize
            } else if header.is_hashed() {
                page::HASHED_CHILD_LEN
            } else {
                page::CHILD_OID_LEN
            };
            if key_len == 0 {
                return Err(ApfsError::Corruption("fixed layout node in variable tree"));
            }
            NodeLayout::Fixed { key_len, val_len }
        } else {
            NodeLayout::Variable
        };
        if let Some(parent) = &parent {
            if parent_index >= parent.entries_cnt() {
                return Err(ApfsError::Invalid("parent index out of range"));
            }
        }
        Ok(Self {
            block: block.into_boxed_slice(),
            header,
            layout,
            paddr,
            parent,
            parent_index,
        })
    }

    /// Object id from the node's header.
    pub fn oid(&self) -> Oid {
        self.header.obj.oid
    }

    /// Transaction that wrote the node.
    pub fn xid(&self) -> Xid {
        self.header.obj.xid
    }

    /// Number of entries.
    pub fn entries_cnt(&self) -> u32 {
        self.header.nkeys
    }

    /// Level above the leaves.
    pub fn level(&self) -> u16 {
        self.header.level
    }

    /// Raw `BTNODE_*` flags.
    pub fn flags(&self) -> u16 {
        self.header.flags
    }

    /// True for level-0 nodes.
    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }

    /// True for the tree's root node.
    pub fn is_root(&self) -> bool {
        self.header.is_root()
    }

    /// Physical address the block was read from.
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// Parent this node was first reached from.
    pub fn parent(&self) -> Option<&Arc<Node>> {
        self.parent.as_ref()
    }

    /// Index of this node's entry in its parent.
    pub fn parent_index(&self) -> u32 {
        self.parent_index
    }

    /// Table layout of this node.
    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// Decoded header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The raw block.
    pub fn block(&self) -> &[u8] {
        &self.block
    }

    /// Returns the entry at `index`, sharing ownership of this node.
    pub fn get_entry(self: &Arc<Self>, index: u32) -> Result<Entry> {
        let (key, val) = self.locate(index)?;
        Ok(Entry {
            node: Arc::clone(self),
            index,
            key,
            val,
        })
    }

    /// Borrowed key bytes at `index`.
    pub fn key_at(&self, index: u32) -> Result<&[u8]> {
        let (key, _) = self.locate(index)?;
        Ok(&self.block[key])
    }

    /// Borrowed value bytes at `index`.
    pub fn val_at(&self, index: u32) -> Result<&[u8]> {
        let (_, val) = self.locate(index)?;
        Ok(&self.block[val])
    }

    /// Child pointer stored in the value of internal entry `index`.
    ///
    /// Hashed trees append a hash after the pointer; only the leading 8 bytes are read.
    pub fn child_at(&self, index: u32) -> Result<u64> {
        if self.is_leaf() {
            return Err(ApfsError::Invalid("leaf entries have no child pointer"));
        }
        let val = self.val_at(index)?;
        let raw = val
            .get(..page::CHILD_OID_LEN)
            .ok_or(ApfsError::Corruption("internal node value shorter than child pointer"))?;
        let mut bytes = [0u8; page::CHILD_OID_LEN];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    fn locate(&self, index: u32) -> Result<(Range<usize>, Range<usize>)> {
        debug_assert!(
            index < self.entries_cnt(),
            "entry index {index} out of range ({} entries)",
            self.entries_cnt()
        );
        if index >= self.entries_cnt() {
            return Err(ApfsError::Invalid("entry index out of range"));
        }
        let toc_start = self.header.toc_start();
        let keys_start = self.header.keys_start();
        let vals_end = self.header.vals_end(self.block.len());
        let idx = index as usize;
        let (k_off, k_len, v_off, v_len) = match self.layout {
            NodeLayout::Fixed { key_len, val_len } => {
                let (k, v) = page::read_kvoff(&self.block, toc_start, idx)?;
                (k, key_len, v, val_len)
            }
            NodeLayout::Variable => {
                let (k, v) = page::read_kvloc(&self.block, toc_start, idx)?;
                (k.off, k.len as usize, v.off, v.len as usize)
            }
        };

        let key_start = keys_start + k_off as usize;
        let key_end = key_start + k_len;
        if key_end > vals_end {
            return Err(ApfsError::Corruption("entry key outside key area"));
        }

        let val = if v_off == page::KVOFF_INVALID {
            vals_end..vals_end
        } else {
            let val_start = vals_end
                .checked_sub(v_off as usize)
                .ok_or(ApfsError::Corruption("entry value offset before block start"))?;
            let val_end = val_start + v_len;
            if val_start < keys_start || val_end > vals_end {
                return Err(ApfsError::Corruption("entry value outside value area"));
            }
            val_start..val_end
        };
        Ok((key_start..key_end, val))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("oid", &self.oid())
            .field("paddr", &self.paddr)
            .field("level", &self.level())
            .field("flags", &format_args!("{:#06x}", self.flags()))
            .field("entries", &self.entries_cnt())
            .field("layout", &self.layout)
            .field("parent_index", &self.parent_index)
            .finish()
    }
}

/// One key/value pair, keeping its node (and so its bytes) alive.
#[derive(Clone)]
pub struct Entry {
    node: Arc<Node>,
    index: u32,
    key: Range<usize>,
    val: Range<usize>,
}

impl Entry {
    /// Key bytes.
    pub fn key(&self) -> &[u8] {
        &self.node.block[self.key.clone()]
    }

    /// Value bytes; empty for ghost entries.
    pub fn val(&self) -> &[u8] {
        &self.node.block[self.val.clone()]
    }

    /// Node the entry lives in.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Position within the node.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("node", &self.node.oid())
            .field("index", &self.index)
            .field("key", &hex::encode(self.key()))
            .field("val", &hex::encode(self.val()))
            .finish()
    }
}
