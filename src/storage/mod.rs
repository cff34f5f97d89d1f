//! Container metadata structures read through B-trees.
//!
//! Implements the on-disk B-tree reader and the object map that resolves the
//! virtual node ids most trees use.

/// B-tree node decoding, search, caching and iteration.
pub mod btree;

/// Object map and the mapper interface trees resolve child ids through.
pub mod omap;

pub use btree::{BTree, BTreeIterator, BTreeOptions, Entry, FindMode, KeyCompare, Node};
pub use omap::{NodeMapper, ObjectMap, OmapVal};
