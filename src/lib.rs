//! Read-only reader for the APFS on-disk B-tree.
//!
//! Decodes fixed and variable layout nodes, resolves virtual node ids through an
//! object map, caches decoded nodes under a bounded budget and exposes point
//! lookups and ordered iteration over raw key/value bytes.

pub mod logging;
pub mod primitives;
pub mod storage;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod types;

pub use primitives::io::{BlockSource, FileBlockSource, MemBlockSource};
pub use storage::btree::codecs::{compare_omap_key, compare_std_key, compare_u64_key};
pub use storage::{
    BTree, BTreeIterator, BTreeOptions, Entry, FindMode, KeyCompare, Node, NodeMapper, ObjectMap,
};
pub use types::{ApfsError, Oid, Paddr, Result, Xid};
