use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B-tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct BTreeStatsSnapshot {
    /// Number of point lookups started
    pub lookups: u64,
    /// Number of leaf node searches performed
    pub leaf_searches: u64,
    /// Number of internal node searches performed
    pub internal_searches: u64,
    /// Number of blocks read from the block source
    pub node_reads: u64,
    /// Number of blocks decoded into nodes
    pub node_decodes: u64,
    /// Number of node requests served from the cache
    pub cache_hits: u64,
    /// Number of node requests that missed the cache
    pub cache_misses: u64,
    /// Number of nodes evicted to respect the cache capacity
    pub cache_evictions: u64,
    /// Number of child ids the object map could not resolve
    pub omap_misses: u64,
}

/// Thread-safe statistics tracking for B-tree reads.
#[derive(Default)]
pub struct BTreeStats {
    lookups: AtomicU64,
    leaf_searches: AtomicU64,
    internal_searches: AtomicU64,
    node_reads: AtomicU64,
    node_decodes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    omap_misses: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of lookups.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf node searches.
    pub fn leaf_searches(&self) -> u64 {
        self.leaf_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal node searches.
    pub fn internal_searches(&self) -> u64 {
        self.internal_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of blocks read.
    pub fn node_reads(&self) -> u64 {
        self.node_reads.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of nodes decoded.
    pub fn node_decodes(&self) -> u64 {
        self.node_decodes.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of cache misses.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of cache evictions.
    pub fn cache_evictions(&self) -> u64 {
        self.cache_evictions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of unresolved child ids.
    pub fn omap_misses(&self) -> u64 {
        self.omap_misses.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_lookups(&self) {
        self.lookups.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_searches(&self) {
        self.leaf_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_searches(&self) {
        self.internal_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_node_reads(&self) {
        self.node_reads.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_node_decodes(&self) {
        self.node_decodes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    #[cfg_attr(not(feature = "node-cache"), allow(dead_code))]
    pub(crate) fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    #[cfg_attr(not(feature = "node-cache"), allow(dead_code))]
    pub(crate) fn inc_cache_evictions(&self) {
        self.cache_evictions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_omap_misses(&self) {
        self.omap_misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            lookups: self.lookups(),
            leaf_searches: self.leaf_searches(),
            internal_searches: self.internal_searches(),
            node_reads: self.node_reads(),
            node_decodes: self.node_decodes(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_evictions: self.cache_evictions(),
            omap_misses: self.omap_misses(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "apfs_btree::stats",
            lookups = snapshot.lookups,
            leaf_searches = snapshot.leaf_searches,
            internal_searches = snapshot.internal_searches,
            node_reads = snapshot.node_reads,
            node_decodes = snapshot.node_decodes,
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            cache_evictions = snapshot.cache_evictions,
            omap_misses = snapshot.omap_misses,
            "btree stats snapshot"
        );
    }
}
