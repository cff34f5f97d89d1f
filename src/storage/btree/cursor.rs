use std::sync::Arc;

use super::node::{Entry, Node};
use super::tree::BTree;
use crate::types::{ApfsError, Result};

/// Forward cursor over leaf entries in key order.
///
/// Holds the current leaf, and through its parent links the whole path back to
/// the root, alive for as long as the cursor points into it.
pub struct BTreeIterator<'a> {
    tree: &'a BTree,
    node: Option<Arc<Node>>,
    index: u32,
    deferred: Option<ApfsError>,
}

impl<'a> BTreeIterator<'a> {
    pub(crate) fn new(tree: &'a BTree, node: Arc<Node>, index: u32) -> Self {
        debug_assert!(node.is_leaf(), "cursor must point into a leaf");
        Self {
            tree,
            node: Some(node),
            index,
            deferred: None,
        }
    }

    pub(crate) fn exhausted(tree: &'a BTree) -> Self {
        Self {
            tree,
            node: None,
            index: 0,
            deferred: None,
        }
    }

    /// Repositions the cursor on `index` of `node`.
    pub fn setup(&mut self, node: Arc<Node>, index: u32) {
        self.node = Some(node);
        self.index = index;
    }

    /// Entry under the cursor, or `None` once the cursor has run past the last entry.
    pub fn entry(&self) -> Result<Option<Entry>> {
        match &self.node {
            Some(node) if self.index < node.entries_cnt() => node.get_entry(self.index).map(Some),
            _ => Ok(None),
        }
    }

    /// Moves to the next entry; returns false once the tree is exhausted.
    ///
    /// Within a leaf this is an increment. At the end of a leaf the cursor climbs
    /// parent links until some ancestor has a later child and then follows first
    /// children down to the next leaf. An exhausted cursor stays exhausted.
    pub fn advance(&mut self) -> Result<bool> {
        let Some(node) = &self.node else {
            return Ok(false);
        };
        if self.index + 1 < node.entries_cnt() {
            self.index += 1;
            return Ok(true);
        }
        match self.tree.next_leaf(node)? {
            Some(next) => {
                self.node = Some(next);
                self.index = 0;
                Ok(true)
            }
            None => {
                self.reset();
                Ok(false)
            }
        }
    }

    /// Clears the cursor; it reports no entry until set up again.
    pub fn reset(&mut self) {
        self.node = None;
        self.index = 0;
    }

    /// True when the cursor holds no position.
    pub fn is_exhausted(&self) -> bool {
        self.node.is_none()
    }

    /// Leaf the cursor currently points into.
    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }

    /// Index within the current leaf.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Iterator for BTreeIterator<'_> {
    type Item = Result<Entry>;

    /// Yields the entry under the cursor and then advances past it.
    ///
    /// A failure while advancing is reported on the following call, after the entry
    /// that was already read.
    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.deferred.take() {
            return Some(Err(err));
        }
        let entry = match self.entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.reset();
                return None;
            }
            Err(err) => {
                self.reset();
                return Some(Err(err));
            }
        };
        if let Err(err) = self.advance() {
            self.reset();
            self.deferred = Some(err);
        }
        Some(Ok(entry))
    }
}
