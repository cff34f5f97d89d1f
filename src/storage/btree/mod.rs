#![forbid(unsafe_code)]

//! Read-only access to on-disk B-trees: node decoding, search, caching and iteration.

/// Node block layout and tree info footer.
pub mod page;

/// Key comparators and key encoders.
pub mod codecs;
#[cfg(feature = "node-cache")]
mod cache;
mod cursor;
mod node;
mod stats;
mod tree;

pub use codecs::KeyCompare;
pub use cursor::BTreeIterator;
pub use node::{Entry, Node, NodeLayout};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, BTreeOptions, FindMode, DEFAULT_CACHE_CAPACITY};

#[cfg(test)]
mod tests;
