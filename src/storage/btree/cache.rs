//! Bounded, lock-guarded map from node id to decoded node.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::node::Node;
use super::stats::BTreeStats;
use crate::types::Result;

/// LRU cache of decoded nodes keyed by node id.
///
/// The lock is held across the whole miss path, so a node id is decoded at most
/// once no matter how many threads ask for it at the same time. Nodes are never
/// re-parented: a hit returns the node exactly as it was first inserted.
pub(crate) struct NodeCache {
    nodes: Mutex<LruCache<u64, Arc<Node>>>,
}

impl NodeCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            nodes: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached node for `id`, or runs `load` under the lock and caches its result.
    ///
    /// `load` returning `Ok(None)` (an unresolvable id) caches nothing.
    pub(crate) fn get_or_load<F>(
        &self,
        id: u64,
        stats: &BTreeStats,
        load: F,
    ) -> Result<Option<Arc<Node>>>
    where
        F: FnOnce() -> Result<Option<Node>>,
    {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(&id) {
            stats.inc_cache_hits();
            tracing::trace!(id, "node cache hit");
            return Ok(Some(Arc::clone(node)));
        }
        stats.inc_cache_misses();
        let Some(node) = load()? else {
            return Ok(None);
        };
        let node = Arc::new(node);
        if let Some((evicted, _)) = nodes.push(id, Arc::clone(&node)) {
            if evicted != id {
                stats.inc_cache_evictions();
                tracing::trace!(id = evicted, "node cache eviction");
            }
        }
        Ok(Some(node))
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.nodes.lock().clear();
    }
}
