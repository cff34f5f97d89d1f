//! Builders for synthetic container images.
//!
//! Writes well-formed, checksummed B-tree nodes and object maps into a
//! [`MemBlockSource`] so trees of any shape can be opened without a real device.
//! Everything here goes through the same on-disk encoders the reader decodes with.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::primitives::io::{BlockSource, MemBlockSource};
use crate::storage::btree::codecs::omap_key;
use crate::storage::btree::page::{
    self, BTreeInfo, Header, Nloc, BTNODE_FIXED_KV_SIZE, BTNODE_HASHED, BTNODE_LEAF, BTNODE_ROOT,
    BTREE_HASHED, BTREE_PHYSICAL, KVOFF_INVALID, KVOFF_LEN, KVLOC_LEN, NODE_HEADER_LEN,
};
use crate::storage::omap::{NodeMapper, OmapPhys, OmapVal, OMAP_KEY_LEN, OMAP_VAL_LEN};
use crate::types::checksum::seal_object;
use crate::types::object::{ObjectHeader, ObjectType, OBJ_PHYSICAL, OBJ_VIRTUAL};
use crate::types::{ApfsError, Oid, Paddr, Result, Xid};

/// Block size used by most synthetic images.
pub const TEST_BLOCK_SIZE: usize = 4096;

/// One key/value pair to store in a leaf; `val: None` writes a ghost entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes, absent for ghosts.
    pub val: Option<Vec<u8>>,
}

impl Record {
    /// A regular entry.
    pub fn new(key: impl Into<Vec<u8>>, val: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            val: Some(val.into()),
        }
    }

    /// An entry without a value.
    pub fn ghost(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            val: None,
        }
    }

    /// Entry keyed by a little-endian `u64`.
    pub fn u64(key: u64, val: impl Into<Vec<u8>>) -> Self {
        Self::new(key.to_le_bytes().to_vec(), val)
    }
}

/// Table layout used for every node of a synthetic tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Layout {
    /// Fixed-size keys and leaf values.
    Fixed {
        /// Key size.
        key_size: u32,
        /// Leaf value size.
        val_size: u32,
    },
    /// Variable-size keys and values.
    Variable,
}

/// Shape and identity of a synthetic tree.
#[derive(Clone, Debug)]
pub struct TreeShape {
    /// Node table layout.
    pub layout: Layout,
    /// Extra `BTREE_*` flags; `BTREE_PHYSICAL` is added for physical trees.
    pub flags: u32,
    /// Maximum entries per leaf.
    pub leaf_capacity: usize,
    /// Maximum children per internal node.
    pub fanout: usize,
    /// Transaction stamped on every node.
    pub xid: Xid,
    /// Object subtype stamped on every node.
    pub subtype: u32,
    /// First virtual object id to hand out; `None` builds a physical tree.
    ///
    /// Ids are assigned leaves first, so two trees of the same shape built from the
    /// same first id share their ids, as successive versions of one tree do.
    pub first_virtual_oid: Option<u64>,
}

impl TreeShape {
    /// Physical tree with fixed-size entries.
    pub fn fixed(key_size: u32, val_size: u32) -> Self {
        Self::with_layout(Layout::Fixed { key_size, val_size })
    }

    /// Physical tree with variable-size entries.
    pub fn variable() -> Self {
        Self::with_layout(Layout::Variable)
    }

    fn with_layout(layout: Layout) -> Self {
        Self {
            layout,
            flags: 0,
            leaf_capacity: 64,
            fanout: 64,
            xid: Xid(1),
            subtype: 0,
            first_virtual_oid: None,
        }
    }

    /// Sets the number of entries per leaf.
    pub fn leaf_capacity(mut self, entries: usize) -> Self {
        self.leaf_capacity = entries.max(1);
        self
    }

    /// Sets the number of children per internal node.
    pub fn fanout(mut self, children: usize) -> Self {
        self.fanout = children.max(2);
        self
    }

    /// Sets the node transaction id.
    pub fn xid(mut self, xid: Xid) -> Self {
        self.xid = xid;
        self
    }

    /// Adds `BTREE_*` flags.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the object subtype.
    pub fn subtype(mut self, subtype: u32) -> Self {
        self.subtype = subtype;
        self
    }

    /// Builds a virtual tree whose node ids start at `first_oid`.
    pub fn virtual_oids(mut self, first_oid: u64) -> Self {
        self.first_virtual_oid = Some(first_oid);
        self
    }

    fn is_physical(&self) -> bool {
        self.first_virtual_oid.is_none()
    }

    fn tree_flags(&self) -> u32 {
        if self.is_physical() {
            self.flags | BTREE_PHYSICAL
        } else {
            self.flags & !BTREE_PHYSICAL
        }
    }
}

/// Ids and addresses of a tree written by [`ImageBuilder::tree`].
#[derive(Clone, Debug)]
pub struct BuiltTree {
    /// Id to open the tree with (the root's address for physical trees).
    pub root: Oid,
    /// Where the root block lives.
    pub root_paddr: Paddr,
    /// Level of the root.
    pub height: u16,
    /// Leaf ids and addresses in key order.
    pub leaves: Vec<(Oid, Paddr)>,
    /// Every node as (id, address), root last.
    pub nodes: Vec<(Oid, Paddr)>,
    /// Transaction the nodes were written at.
    pub xid: Xid,
}

impl BuiltTree {
    /// Object map entries that make every node of a virtual tree resolvable.
    pub fn mappings(&self, block_size: usize) -> Vec<(Oid, Xid, OmapVal)> {
        self.nodes
            .iter()
            .map(|&(oid, paddr)| {
                let val = OmapVal {
                    flags: 0,
                    size: block_size as u32,
                    paddr,
                };
                (oid, self.xid, val)
            })
            .collect()
    }
}

struct PendingNode {
    id: u64,
    paddr: Paddr,
    level: u16,
    records: Vec<Record>,
}

/// Allocates blocks in a [`MemBlockSource`] and writes trees and object maps into it.
pub struct ImageBuilder {
    source: Arc<MemBlockSource>,
    next_paddr: u64,
    next_oid: u64,
}

impl ImageBuilder {
    /// Starts an empty image; block zero is left unused.
    pub fn new(block_size: usize) -> Result<Self> {
        Ok(Self {
            source: Arc::new(MemBlockSource::new(block_size, 1)?),
            next_paddr: 1,
            next_oid: 0,
        })
    }

    /// The image being written.
    pub fn source(&self) -> Arc<MemBlockSource> {
        Arc::clone(&self.source)
    }

    /// Block size of the image.
    pub fn block_size(&self) -> usize {
        self.source.block_size()
    }

    /// Reserves the next free block.
    pub fn alloc(&mut self) -> Paddr {
        let paddr = Paddr(self.next_paddr);
        self.next_paddr += 1;
        paddr
    }

    /// Writes a tree holding `records`, split into leaves of `shape.leaf_capacity`.
    ///
    /// Records must already be sorted under the comparator the tree will be read with.
    pub fn tree(&mut self, shape: &TreeShape, records: Vec<Record>) -> Result<BuiltTree> {
        let leaves = if records.is_empty() {
            vec![Vec::new()]
        } else {
            let mut leaves = Vec::new();
            let mut rest = records;
            while rest.len() > shape.leaf_capacity {
                let tail = rest.split_off(shape.leaf_capacity);
                leaves.push(rest);
                rest = tail;
            }
            leaves.push(rest);
            leaves
        };
        self.tree_from_leaves(shape, leaves)
    }

    /// Writes a tree whose leaves hold exactly the given groups, in order.
    ///
    /// Only a single-leaf tree may have an empty group.
    pub fn tree_from_leaves(
        &mut self,
        shape: &TreeShape,
        leaves: Vec<Vec<Record>>,
    ) -> Result<BuiltTree> {
        if leaves.is_empty() {
            return Err(ApfsError::Invalid("tree needs at least one leaf"));
        }
        if leaves.len() > 1 && leaves.iter().any(Vec::is_empty) {
            return Err(ApfsError::Invalid("only a lone root leaf may be empty"));
        }
        if let Some(first) = shape.first_virtual_oid {
            self.next_oid = first;
        }
        let key_count = leaves.iter().map(Vec::len).sum::<usize>() as u64;
        let mut levels: Vec<Vec<PendingNode>> = Vec::new();
        let mut current: Vec<PendingNode> = leaves
            .into_iter()
            .map(|records| self.pending(shape, 0, records))
            .collect();
        while current.len() > 1 {
            let level = current[0].level + 1;
            let mut parents = Vec::new();
            for group in current.chunks(shape.fanout) {
                let records = group
                    .iter()
                    .map(|child| Record::new(child.records[0].key.clone(), child_value(shape, child.id)))
                    .collect();
                parents.push(self.pending(shape, level, records));
            }
            levels.push(current);
            current = parents;
        }
        levels.push(current);

        let longest_key = levels[0]
            .iter()
            .flat_map(|node| node.records.iter())
            .map(|r| r.key.len())
            .max()
            .unwrap_or(0) as u32;
        let longest_val = levels[0]
            .iter()
            .flat_map(|node| node.records.iter())
            .filter_map(|r| r.val.as_ref().map(Vec::len))
            .max()
            .unwrap_or(0) as u32;
        let node_count = levels.iter().map(Vec::len).sum::<usize>() as u64;
        let (key_size, val_size) = match shape.layout {
            Layout::Fixed { key_size, val_size } => (key_size, val_size),
            Layout::Variable => (0, 0),
        };
        let info = BTreeInfo {
            flags: shape.tree_flags(),
            node_size: self.block_size() as u32,
            key_size,
            val_size,
            longest_key,
            longest_val,
            key_count,
            node_count,
        };

        let mut nodes = Vec::new();
        let root_level = levels.len() - 1;
        for (depth, level) in levels.iter().enumerate() {
            for node in level {
                let is_root = depth == root_level;
                let block = encode_node(self.block_size(), shape, node, is_root.then_some(&info))?;
                self.source.write_block(node.paddr, &block)?;
                nodes.push((Oid(node.id), node.paddr));
            }
        }
        let root = &levels[root_level][0];
        Ok(BuiltTree {
            root: Oid(root.id),
            root_paddr: root.paddr,
            height: root.level,
            leaves: levels[0].iter().map(|n| (Oid(n.id), n.paddr)).collect(),
            nodes,
            xid: shape.xid,
        })
    }

    /// Writes an object map holding `mappings` and returns the address of its header.
    pub fn object_map(&mut self, mappings: &[(Oid, Xid, OmapVal)], xid: Xid) -> Result<Paddr> {
        let mut sorted = mappings.to_vec();
        sorted.sort_by_key(|(oid, xid, _)| (oid.0, xid.0));
        let records = sorted
            .iter()
            .map(|(oid, xid, val)| Record::new(omap_key(*oid, *xid).to_vec(), val.encode().to_vec()))
            .collect();
        let shape = TreeShape::fixed(OMAP_KEY_LEN as u32, OMAP_VAL_LEN as u32)
            .xid(xid)
            .subtype(ObjectType::Omap.as_u32())
            .leaf_capacity(100)
            .fanout(100);
        let tree = self.tree(&shape, records)?;

        let paddr = self.alloc();
        let phys = OmapPhys {
            obj: ObjectHeader::new(
                Oid(paddr.0),
                xid,
                ObjectType::Omap.as_u32() | OBJ_PHYSICAL,
                0,
            ),
            flags: 0,
            snap_count: 0,
            tree_type: ObjectType::BTree.as_u32() | OBJ_PHYSICAL,
            snapshot_tree_type: 0,
            tree_oid: tree.root,
            snapshot_tree_oid: Oid(0),
            most_recent_snap: Xid(0),
            pending_revert_min: Xid(0),
            pending_revert_max: Xid(0),
        };
        let mut block = vec![0u8; self.block_size()];
        phys.encode(&mut block)?;
        seal_object(&mut block);
        self.source.write_block(paddr, &block)?;
        Ok(paddr)
    }

    /// Applies `edit` to the block at `paddr`, resealing its checksum when `reseal` is set.
    pub fn patch_block<F>(&self, paddr: Paddr, reseal: bool, edit: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut block = self.source.read_block_vec(paddr)?;
        edit(&mut block);
        if reseal {
            seal_object(&mut block);
        }
        self.source.write_block(paddr, &block)
    }

    fn pending(&mut self, shape: &TreeShape, level: u16, records: Vec<Record>) -> PendingNode {
        let paddr = self.alloc();
        let id = if shape.is_physical() {
            paddr.0
        } else {
            let id = self.next_oid;
            self.next_oid += 1;
            id
        };
        PendingNode {
            id,
            paddr,
            level,
            records,
        }
    }
}

fn child_value(shape: &TreeShape, child: u64) -> Vec<u8> {
    let mut val = child.to_le_bytes().to_vec();
    if shape.flags & BTREE_HASHED != 0 {
        val.resize(page::HASHED_CHILD_LEN, 0);
    }
    val
}

fn encode_node(
    block_size: usize,
    shape: &TreeShape,
    node: &PendingNode,
    info: Option<&BTreeInfo>,
) -> Result<Vec<u8>> {
    let mut block = vec![0u8; block_size];
    let is_leaf = node.level == 0;
    let fixed = matches!(shape.layout, Layout::Fixed { .. });
    let mut flags = 0u16;
    if info.is_some() {
        flags |= BTNODE_ROOT;
    }
    if is_leaf {
        flags |= BTNODE_LEAF;
    }
    if fixed {
        flags |= BTNODE_FIXED_KV_SIZE;
    }
    if !is_leaf && shape.flags & BTREE_HASHED != 0 {
        flags |= BTNODE_HASHED;
    }
    let storage = if shape.is_physical() {
        OBJ_PHYSICAL
    } else {
        OBJ_VIRTUAL
    };
    let kind = if info.is_some() {
        ObjectType::BTree
    } else {
        ObjectType::BTreeNode
    };

    let entry_len = if fixed { KVOFF_LEN } else { KVLOC_LEN };
    let toc_len = node.records.len() * entry_len;
    let mut header = Header {
        obj: ObjectHeader::new(Oid(node.id), shape.xid, kind.as_u32() | storage, shape.subtype),
        flags,
        level: node.level,
        nkeys: node.records.len() as u32,
        table_space: Nloc {
            off: 0,
            len: toc_len as u16,
        },
        free_space: Nloc::default(),
        key_free_list: Nloc::default(),
        val_free_list: Nloc::default(),
    };
    let toc_start = header.toc_start();
    let keys_start = header.keys_start();
    let vals_end = header.vals_end(block_size);

    let mut key_off = 0usize;
    let mut val_off = 0usize;
    for (idx, record) in node.records.iter().enumerate() {
        if let Layout::Fixed { key_size, val_size } = shape.layout {
            if record.key.len() != key_size as usize {
                return Err(ApfsError::Invalid("key does not match fixed key size"));
            }
            if is_leaf && record.val.as_ref().is_some_and(|v| v.len() != val_size as usize) {
                return Err(ApfsError::Invalid("value does not match fixed value size"));
            }
        }
        let key_at = keys_start + key_off;
        if key_at + record.key.len() > vals_end.saturating_sub(val_off) {
            return Err(ApfsError::Invalid("entries do not fit in one node"));
        }
        block[key_at..key_at + record.key.len()].copy_from_slice(&record.key);
        let k = Nloc {
            off: key_off as u16,
            len: record.key.len() as u16,
        };
        key_off += record.key.len();

        let v = match &record.val {
            Some(val) => {
                val_off += val.len();
                if keys_start + key_off > vals_end.saturating_sub(val_off) {
                    return Err(ApfsError::Invalid("entries do not fit in one node"));
                }
                let val_at = vals_end - val_off;
                block[val_at..val_at + val.len()].copy_from_slice(val);
                Nloc {
                    off: val_off as u16,
                    len: val.len() as u16,
                }
            }
            None => Nloc {
                off: KVOFF_INVALID,
                len: 0,
            },
        };
        if fixed {
            page::write_kvoff(&mut block, toc_start, idx, k.off, v.off);
        } else {
            page::write_kvloc(&mut block, toc_start, idx, k, v);
        }
    }
    header.free_space = Nloc {
        off: key_off as u16,
        len: (vals_end - val_off - keys_start - key_off) as u16,
    };
    debug_assert!(keys_start >= NODE_HEADER_LEN);
    header.encode(&mut block)?;
    if let Some(info) = info {
        info.encode(&mut block)?;
    }
    seal_object(&mut block);
    Ok(block)
}

/// In-memory [`NodeMapper`] keyed by (oid, xid), resolving to the newest mapping at or
/// before the requested transaction.
#[derive(Default)]
pub struct MapTable {
    entries: RwLock<BTreeMap<(u64, u64), Paddr>>,
}

impl MapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every node of a virtual tree.
    pub fn from_tree(tree: &BuiltTree) -> Self {
        let table = Self::new();
        for &(oid, paddr) in &tree.nodes {
            table.insert(oid, tree.xid, paddr);
        }
        table
    }

    /// Maps `oid` to `paddr` from transaction `xid` onwards.
    pub fn insert(&self, oid: Oid, xid: Xid, paddr: Paddr) {
        self.entries.write().insert((oid.0, xid.0), paddr);
    }

    /// Drops every mapping of `oid`.
    pub fn remove(&self, oid: Oid) {
        self.entries.write().retain(|&(id, _), _| id != oid.0);
    }
}

impl NodeMapper for MapTable {
    fn resolve(&self, oid: Oid, xid: Xid) -> Result<Option<Paddr>> {
        let entries = self.entries.read();
        Ok(entries
            .range((oid.0, 0)..=(oid.0, xid.0))
            .next_back()
            .map(|(_, paddr)| *paddr))
    }
}
