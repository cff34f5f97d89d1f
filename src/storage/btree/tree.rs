use std::sync::Arc;

use tracing::{debug, warn};

use super::codecs::KeyCompare;
use super::cursor::BTreeIterator;
use super::node::{Entry, Node};
use super::page::{BTreeInfo, Header};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::primitives::io::BlockSource;
use crate::storage::omap::NodeMapper;
use crate::types::checksum;
use crate::types::object::{ObjectHeader, ObjectType};
use crate::types::{ApfsError, Oid, Paddr, Result, Xid};

#[cfg(feature = "node-cache")]
use super::cache::NodeCache;

/// Default bound on cached nodes; 8192 nodes of 4 KiB is 32 MiB.
pub const DEFAULT_CACHE_CAPACITY: usize = 8192;

/// Configuration knobs for opening a tree.
#[derive(Clone, Debug)]
pub struct BTreeOptions {
    /// Maximum number of decoded nodes retained by the node cache
    pub cache_capacity: usize,
    /// Whether to verify the Fletcher-64 checksum of every node block
    pub verify_checksums: bool,
    /// Whether to reject blocks whose object type is not a B-tree node
    pub check_object_type: bool,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            verify_checksums: true,
            check_object_type: true,
        }
    }
}

impl BTreeOptions {
    /// Sets the node cache capacity (clamped to at least one node).
    pub fn cache_capacity(mut self, nodes: usize) -> Self {
        self.cache_capacity = nodes.max(1);
        self
    }

    /// Enables or disables checksum verification.
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Enables or disables object type checks.
    pub fn check_object_type(mut self, enabled: bool) -> Self {
        self.check_object_type = enabled;
        self
    }
}

/// Which entry a binary search over one node selects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FindMode {
    /// Exact match only (first of equal entries).
    Eq,
    /// Largest entry `<=` the key (last of equal entries).
    Le,
    /// Largest entry `<` the key.
    Lt,
    /// Smallest entry `>=` the key (first of equal entries).
    Ge,
    /// Smallest entry `>` the key.
    Gt,
}

/// Read-only view of one on-disk B-tree.
///
/// Nodes are decoded lazily and shared through the node cache; the tree itself is
/// `Send + Sync` and may be searched from several threads at once.
pub struct BTree {
    source: Arc<dyn BlockSource>,
    mapper: Option<Arc<dyn NodeMapper>>,
    root: Arc<Node>,
    info: BTreeInfo,
    root_oid: Oid,
    xid: Xid,
    options: BTreeOptions,
    stats: Arc<BTreeStats>,
    #[cfg(feature = "node-cache")]
    cache: NodeCache,
}

impl BTree {
    /// Locates and decodes the root node, then reads the tree info footer from it.
    ///
    /// With a mapper, `root_oid` is a virtual id resolved at `xid`; without one it is
    /// the root's physical address. Fails with [`ApfsError::NotFound`] when the mapper
    /// has no entry for the root.
    pub fn open(
        source: Arc<dyn BlockSource>,
        root_oid: Oid,
        xid: Xid,
        mapper: Option<Arc<dyn NodeMapper>>,
        options: BTreeOptions,
    ) -> Result<Self> {
        let stats = Arc::new(BTreeStats::default());
        let paddr = match &mapper {
            Some(mapper) => match mapper.resolve(root_oid, xid)? {
                Some(paddr) => paddr,
                None => {
                    stats.inc_omap_misses();
                    warn!(oid = root_oid.0, xid = xid.0, "btree root not in object map");
                    return Err(ApfsError::NotFound);
                }
            },
            None => Paddr(root_oid.0),
        };
        let block = source.read_block_vec(paddr)?;
        stats.inc_node_reads();
        verify_block(&block, paddr, ObjectType::BTree, &options)?;
        let header = Header::parse(&block)?;
        if !header.is_root() {
            return Err(ApfsError::Corruption("btree root node lacks root flag"));
        }
        let info = BTreeInfo::parse(&block)?;
        if info.node_size as usize != source.block_size() {
            return Err(ApfsError::Corruption("btree node size differs from block size"));
        }
        let root = Node::decode(block, paddr, None, 0, &info)?;
        stats.inc_node_decodes();
        if root.oid() != root_oid {
            warn!(requested = root_oid.0, found = root.oid().0, "btree root id mismatch");
        }
        debug!(
            oid = root_oid.0,
            xid = xid.0,
            paddr = paddr.0,
            level = root.level(),
            flags = info.flags,
            key_size = info.key_size,
            val_size = info.val_size,
            keys = info.key_count,
            nodes = info.node_count,
            "btree opened"
        );
        Ok(Self {
            source,
            mapper,
            root: Arc::new(root),
            info,
            root_oid,
            xid,
            #[cfg(feature = "node-cache")]
            cache: NodeCache::new(options.cache_capacity),
            options,
            stats,
        })
    }

    /// Fixed key size, zero for variable-size trees.
    pub fn key_len(&self) -> u32 {
        self.info.key_size
    }

    /// Fixed value size, zero for variable-size trees.
    pub fn val_len(&self) -> u32 {
        self.info.val_size
    }

    /// The tree info footer read from the root.
    pub fn info(&self) -> &BTreeInfo {
        &self.info
    }

    /// Root node.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Id the tree was opened with.
    pub fn root_oid(&self) -> Oid {
        self.root_oid
    }

    /// Transaction the tree is read at.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    /// Access the live statistics counters for this tree.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the current statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emit the current statistics to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    /// Number of nodes currently held by the cache.
    pub fn cached_nodes(&self) -> usize {
        #[cfg(feature = "node-cache")]
        {
            self.cache.len()
        }
        #[cfg(not(feature = "node-cache"))]
        {
            0
        }
    }

    /// Drops every cached node.
    pub fn clear_cache(&self) {
        #[cfg(feature = "node-cache")]
        self.cache.clear();
    }

    /// Point lookup: exact match, or the greatest entry `<=` the key when `exact` is false.
    pub fn lookup<C>(&self, key: &[u8], cmp: &C, exact: bool) -> Result<Option<Entry>>
    where
        C: KeyCompare + ?Sized,
    {
        let mode = if exact { FindMode::Eq } else { FindMode::Le };
        self.lookup_with(key, cmp, mode)
    }

    /// Point lookup with an explicit find mode.
    ///
    /// Internal nodes are always searched with `Le`; `mode` only applies at the leaf.
    /// Nearest-match modes continue into neighbouring leaves when the answer lies
    /// across a leaf boundary, and runs of equal keys are followed across leaves so
    /// `Eq` and `Ge` see the first occurrence in the whole tree.
    pub fn lookup_with<C>(&self, key: &[u8], cmp: &C, mode: FindMode) -> Result<Option<Entry>>
    where
        C: KeyCompare + ?Sized,
    {
        self.stats.inc_lookups();
        let found = match mode {
            FindMode::Eq => match self.seek_first_ge(key, cmp)? {
                Some((leaf, idx)) => {
                    let hit = cmp.compare(key, leaf.key_at(idx)?).is_eq();
                    hit.then_some((leaf, idx))
                }
                None => None,
            },
            FindMode::Ge => self.seek_first_ge(key, cmp)?,
            FindMode::Lt => self.seek_last_lt(key, cmp)?,
            FindMode::Le => self.seek_last_le(key, cmp)?,
            FindMode::Gt => self.seek_first_gt(key, cmp)?,
        };
        match found {
            Some((leaf, idx)) => leaf.get_entry(idx).map(Some),
            None => Ok(None),
        }
    }

    /// Returns a cursor on the first entry `>=` the key, or an exhausted cursor.
    pub fn get_iterator<C>(&self, key: &[u8], cmp: &C) -> Result<BTreeIterator<'_>>
    where
        C: KeyCompare + ?Sized,
    {
        match self.seek_first_ge(key, cmp)? {
            Some((leaf, idx)) => Ok(BTreeIterator::new(self, leaf, idx)),
            None => Ok(BTreeIterator::exhausted(self)),
        }
    }

    /// Returns a cursor on the first entry of the tree, or an exhausted cursor when empty.
    pub fn get_iterator_begin(&self) -> Result<BTreeIterator<'_>> {
        let mut node = Arc::clone(&self.root);
        while !node.is_leaf() {
            if node.entries_cnt() == 0 {
                return Err(ApfsError::Corruption("internal node without entries"));
            }
            match self.child_node(&node, 0)? {
                Some(child) => node = child,
                None => {
                    return Ok(match self.next_leaf_from(Some(node), 1)? {
                        Some(leaf) => BTreeIterator::new(self, leaf, 0),
                        None => BTreeIterator::exhausted(self),
                    })
                }
            }
        }
        if node.entries_cnt() > 0 {
            return Ok(BTreeIterator::new(self, node, 0));
        }
        match self.next_leaf(&node)? {
            Some(next) => Ok(BTreeIterator::new(self, next, 0)),
            None => Ok(BTreeIterator::exhausted(self)),
        }
    }

    /// Position of the first entry `>=` key in the whole tree.
    ///
    /// The descent lands in the last leaf whose separator is `<=` key. Equal keys may
    /// continue in earlier leaves, so while the run reaches a leaf's first entry the
    /// search steps back to the previous leaf.
    fn seek_first_ge<C>(&self, key: &[u8], cmp: &C) -> Result<Option<(Arc<Node>, u32)>>
    where
        C: KeyCompare + ?Sized,
    {
        let (mut found, mut prev) = match self.descend(key, cmp, true)? {
            Descent::Leaf(leaf) => {
                self.stats.inc_leaf_searches();
                let count = leaf.entries_cnt();
                let idx = lower_bound(&leaf, key, cmp)?;
                if idx > 0 && idx < count {
                    return Ok(Some((leaf, idx)));
                }
                if idx == count {
                    return Ok(self.next_leaf(&leaf)?.map(|next| (next, 0)));
                }
                let prev = if self.run_may_continue_back(&leaf, key, cmp)? {
                    self.prev_leaf(&leaf)?
                } else {
                    None
                };
                (Some((leaf, 0)), prev)
            }
            Descent::Unmapped { parent, idx } => {
                let next = self.next_leaf_from(Some(Arc::clone(&parent)), idx + 1)?;
                let prev = if cmp.compare(key, parent.key_at(idx)?).is_eq() {
                    self.prev_leaf_from(Some(parent), idx)?
                } else {
                    None
                };
                (next.map(|leaf| (leaf, 0)), prev)
            }
            Descent::BeforeFirst => return Ok(None),
        };
        while let Some(leaf) = prev {
            let idx = lower_bound(&leaf, key, cmp)?;
            if idx == leaf.entries_cnt() {
                break;
            }
            prev = if idx == 0 { self.prev_leaf(&leaf)? } else { None };
            found = Some((leaf, idx));
        }
        Ok(found)
    }

    /// Position of the last entry `<` key, scanning back over leaves made only of
    /// entries equal to key.
    fn seek_last_lt<C>(&self, key: &[u8], cmp: &C) -> Result<Option<(Arc<Node>, u32)>>
    where
        C: KeyCompare + ?Sized,
    {
        let mut prev = match self.descend(key, cmp, false)? {
            Descent::Leaf(leaf) => {
                self.stats.inc_leaf_searches();
                let idx = lower_bound(&leaf, key, cmp)?;
                if idx > 0 {
                    return Ok(Some((leaf, idx - 1)));
                }
                self.prev_leaf(&leaf)?
            }
            Descent::Unmapped { parent, idx } => self.prev_leaf_from(Some(parent), idx)?,
            Descent::BeforeFirst => return Ok(None),
        };
        while let Some(leaf) = prev {
            let idx = lower_bound(&leaf, key, cmp)?;
            if idx > 0 {
                return Ok(Some((leaf, idx - 1)));
            }
            prev = self.prev_leaf(&leaf)?;
        }
        Ok(None)
    }

    /// Position of the last entry `<=` key.
    fn seek_last_le<C>(&self, key: &[u8], cmp: &C) -> Result<Option<(Arc<Node>, u32)>>
    where
        C: KeyCompare + ?Sized,
    {
        let prev = match self.descend(key, cmp, false)? {
            Descent::Leaf(leaf) => {
                self.stats.inc_leaf_searches();
                let idx = upper_bound(&leaf, key, cmp)?;
                if idx > 0 {
                    return Ok(Some((leaf, idx - 1)));
                }
                self.prev_leaf(&leaf)?
            }
            Descent::Unmapped { parent, idx } => self.prev_leaf_from(Some(parent), idx)?,
            Descent::BeforeFirst => return Ok(None),
        };
        Ok(prev.map(|leaf| {
            let last = leaf.entries_cnt() - 1;
            (leaf, last)
        }))
    }

    /// Position of the first entry `>` key.
    fn seek_first_gt<C>(&self, key: &[u8], cmp: &C) -> Result<Option<(Arc<Node>, u32)>>
    where
        C: KeyCompare + ?Sized,
    {
        let next = match self.descend(key, cmp, true)? {
            Descent::Leaf(leaf) => {
                self.stats.inc_leaf_searches();
                let idx = upper_bound(&leaf, key, cmp)?;
                if idx < leaf.entries_cnt() {
                    return Ok(Some((leaf, idx)));
                }
                self.next_leaf(&leaf)?
            }
            Descent::Unmapped { parent, idx } => self.next_leaf_from(Some(parent), idx + 1)?,
            Descent::BeforeFirst => return Ok(None),
        };
        Ok(next.map(|leaf| (leaf, 0)))
    }

    /// Whether entries equal to key may sit in the leaf before `leaf`.
    ///
    /// Earlier leaves hold keys `<=` the separator this leaf was reached through, so
    /// the run can only continue back when that separator or the leaf's first key
    /// equals key.
    fn run_may_continue_back<C>(&self, leaf: &Node, key: &[u8], cmp: &C) -> Result<bool>
    where
        C: KeyCompare + ?Sized,
    {
        if cmp.compare(key, leaf.key_at(0)?).is_eq() {
            return Ok(true);
        }
        match leaf.parent() {
            Some(parent) => Ok(cmp.compare(key, parent.key_at(leaf.parent_index())?).is_eq()),
            None => Ok(false),
        }
    }

    /// Walks from the root to the leaf whose key range covers `key`.
    ///
    /// `leftmost_fallback` descends into the first child when the key sorts before
    /// every separator; otherwise such a key has no covering leaf. A child the object
    /// map cannot resolve stops the walk and is reported with its position.
    fn descend<C>(&self, key: &[u8], cmp: &C, leftmost_fallback: bool) -> Result<Descent>
    where
        C: KeyCompare + ?Sized,
    {
        let mut node = Arc::clone(&self.root);
        while !node.is_leaf() {
            self.stats.inc_internal_searches();
            let idx = match find_bin(&node, key, cmp, FindMode::Le)? {
                Some(idx) => idx,
                None if leftmost_fallback && node.entries_cnt() > 0 => 0,
                None => return Ok(Descent::BeforeFirst),
            };
            match self.child_node(&node, idx)? {
                Some(child) => node = child,
                None => return Ok(Descent::Unmapped { parent: node, idx }),
            }
        }
        Ok(Descent::Leaf(node))
    }

    /// First non-empty leaf after `from` in key order.
    pub(crate) fn next_leaf(&self, from: &Arc<Node>) -> Result<Option<Arc<Node>>> {
        self.next_leaf_from(from.parent().cloned(), from.parent_index() + 1)
    }

    /// First non-empty leaf under `parent[idx..]`, or after `parent` when exhausted.
    ///
    /// Climbs parent links until an ancestor has a later child, then follows index 0
    /// down. Subtrees whose root the object map cannot resolve are skipped.
    fn next_leaf_from(&self, parent: Option<Arc<Node>>, idx: u32) -> Result<Option<Arc<Node>>> {
        let mut parent = parent;
        let mut idx = idx;
        loop {
            let Some(current) = parent else {
                return Ok(None);
            };
            if idx >= current.entries_cnt() {
                parent = current.parent().cloned();
                idx = current.parent_index() + 1;
                continue;
            }
            match self.edge_leaf(&current, idx, Edge::First)? {
                Some(leaf) if leaf.entries_cnt() > 0 => return Ok(Some(leaf)),
                Some(leaf) => {
                    parent = leaf.parent().cloned();
                    idx = leaf.parent_index() + 1;
                }
                None => {
                    idx += 1;
                    parent = Some(current);
                }
            }
        }
    }

    /// Last non-empty leaf before `from` in key order.
    pub(crate) fn prev_leaf(&self, from: &Arc<Node>) -> Result<Option<Arc<Node>>> {
        self.prev_leaf_from(from.parent().cloned(), from.parent_index())
    }

    /// Last non-empty leaf under `parent[..idx]`, or before `parent` when exhausted.
    fn prev_leaf_from(&self, parent: Option<Arc<Node>>, idx: u32) -> Result<Option<Arc<Node>>> {
        let mut parent = parent;
        let mut idx = idx;
        loop {
            let Some(current) = parent else {
                return Ok(None);
            };
            if idx == 0 {
                parent = current.parent().cloned();
                idx = current.parent_index();
                continue;
            }
            idx -= 1;
            match self.edge_leaf(&current, idx, Edge::Last)? {
                Some(leaf) if leaf.entries_cnt() > 0 => return Ok(Some(leaf)),
                Some(leaf) => {
                    parent = leaf.parent().cloned();
                    idx = leaf.parent_index();
                }
                None => parent = Some(current),
            }
        }
    }

    /// Follows the first (or last) child chain from `parent[idx]` down to a leaf.
    fn edge_leaf(&self, parent: &Arc<Node>, idx: u32, edge: Edge) -> Result<Option<Arc<Node>>> {
        let Some(mut node) = self.child_node(parent, idx)? else {
            return Ok(None);
        };
        while !node.is_leaf() {
            let count = node.entries_cnt();
            if count == 0 {
                return Err(ApfsError::Corruption("internal node without entries"));
            }
            let next = match edge {
                Edge::First => 0,
                Edge::Last => count - 1,
            };
            match self.child_node(&node, next)? {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    /// Resolves the child named by internal entry `idx` of `parent`.
    fn child_node(&self, parent: &Arc<Node>, idx: u32) -> Result<Option<Arc<Node>>> {
        let child_id = parent.child_at(idx)?;
        let Some(child) = self.get_node(child_id, Some(parent), idx)? else {
            return Ok(None);
        };
        if u32::from(child.level()) + 1 != u32::from(parent.level()) {
            return Err(ApfsError::Corruption("child node level does not descend"));
        }
        Ok(Some(child))
    }

    /// Returns the node for `id`, from the cache when possible.
    ///
    /// `parent` and `parent_index` are only used when the node has to be decoded; a
    /// cached node keeps the parent it was first reached from.
    pub fn get_node(
        &self,
        id: u64,
        parent: Option<&Arc<Node>>,
        parent_index: u32,
    ) -> Result<Option<Arc<Node>>> {
        #[cfg(feature = "node-cache")]
        {
            self.cache.get_or_load(id, &self.stats, || {
                self.fetch_node(id, parent.cloned(), parent_index)
            })
        }
        #[cfg(not(feature = "node-cache"))]
        {
            self.stats.inc_cache_misses();
            Ok(self
                .fetch_node(id, parent.cloned(), parent_index)?
                .map(Arc::new))
        }
    }

    fn fetch_node(
        &self,
        id: u64,
        parent: Option<Arc<Node>>,
        parent_index: u32,
    ) -> Result<Option<Node>> {
        let Some(paddr) = self.resolve_child(id)? else {
            return Ok(None);
        };
        let block = self.source.read_block_vec(paddr)?;
        self.stats.inc_node_reads();
        verify_block(&block, paddr, ObjectType::BTreeNode, &self.options)?;
        let node = Node::decode(block, paddr, parent, parent_index, &self.info)?;
        self.stats.inc_node_decodes();
        if node.oid().0 != id {
            warn!(requested = id, found = node.oid().0, paddr = paddr.0, "btree node id mismatch");
        }
        debug!(
            id,
            paddr = paddr.0,
            level = node.level(),
            entries = node.entries_cnt(),
            "btree node decoded"
        );
        Ok(Some(node))
    }

    fn resolve_child(&self, id: u64) -> Result<Option<Paddr>> {
        let mapper = match &self.mapper {
            Some(mapper) if !self.info.is_physical() => mapper,
            _ => return Ok(Some(Paddr(id))),
        };
        match mapper.resolve(Oid(id), self.xid)? {
            Some(paddr) => Ok(Some(paddr)),
            None => {
                self.stats.inc_omap_misses();
                warn!(oid = id, xid = self.xid.0, "btree child not in object map");
                Ok(None)
            }
        }
    }
}

/// Where a root-to-leaf walk stopped.
enum Descent {
    Leaf(Arc<Node>),
    /// `parent[idx]` names a child the object map has no entry for.
    Unmapped { parent: Arc<Node>, idx: u32 },
    /// The key sorts before every separator of the root.
    BeforeFirst,
}

#[derive(Clone, Copy)]
enum Edge {
    First,
    Last,
}

fn verify_block(
    block: &[u8],
    paddr: Paddr,
    expected: ObjectType,
    options: &BTreeOptions,
) -> Result<()> {
    if options.verify_checksums && !checksum::verify_object(block) {
        warn!(paddr = paddr.0, "btree node checksum mismatch");
        return Err(ApfsError::Checksum { paddr });
    }
    if options.check_object_type {
        let header = ObjectHeader::decode(block)?;
        if header.object_type() != Some(expected) {
            return Err(ApfsError::UnexpectedObject {
                paddr,
                expected: match expected {
                    ObjectType::BTree => "btree root",
                    ObjectType::BTreeNode => "btree node",
                    ObjectType::Omap => "object map",
                },
                found: header.o_type,
            });
        }
    }
    Ok(())
}

/// Binary search over one node.
///
/// Equal runs resolve to their first entry for `Eq`, `Ge` and `Lt`, and to their last
/// entry for `Le` and `Gt`.
pub(crate) fn find_bin<C>(node: &Node, key: &[u8], cmp: &C, mode: FindMode) -> Result<Option<u32>>
where
    C: KeyCompare + ?Sized,
{
    let count = node.entries_cnt();
    if count == 0 {
        return Ok(None);
    }
    match mode {
        FindMode::Eq => {
            let lower = lower_bound(node, key, cmp)?;
            if lower < count && cmp.compare(key, node.key_at(lower)?).is_eq() {
                Ok(Some(lower))
            } else {
                Ok(None)
            }
        }
        FindMode::Ge => {
            let lower = lower_bound(node, key, cmp)?;
            Ok((lower < count).then_some(lower))
        }
        FindMode::Lt => Ok(lower_bound(node, key, cmp)?.checked_sub(1)),
        FindMode::Le => Ok(upper_bound(node, key, cmp)?.checked_sub(1)),
        FindMode::Gt => {
            let upper = upper_bound(node, key, cmp)?;
            Ok((upper < count).then_some(upper))
        }
    }
}

/// Index of the first entry `>=` key, `entries_cnt()` when there is none.
fn lower_bound<C>(node: &Node, key: &[u8], cmp: &C) -> Result<u32>
where
    C: KeyCompare + ?Sized,
{
    partition_point(node, node.entries_cnt(), |entry| {
        cmp.compare(key, entry) != std::cmp::Ordering::Greater
    })
}

/// Index of the first entry `>` key, `entries_cnt()` when there is none.
fn upper_bound<C>(node: &Node, key: &[u8], cmp: &C) -> Result<u32>
where
    C: KeyCompare + ?Sized,
{
    partition_point(node, node.entries_cnt(), |entry| cmp.compare(key, entry).is_lt())
}

/// First index in `0..count` whose key satisfies `pred`; `pred` must be monotone.
fn partition_point<P>(node: &Node, count: u32, mut pred: P) -> Result<u32>
where
    P: FnMut(&[u8]) -> bool,
{
    let mut lo = 0u32;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(node.key_at(mid)?) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}
