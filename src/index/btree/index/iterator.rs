use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, LeafNode};
use crate::index::btree::serialization::deserialize_node;
use crate::storage::buffer::BufferPoolManager;
use super::base::BTreeIndex;

/// Forward iterator over leaf entries in key order.
///
/// The iterator pins the leaf it is positioned on and releases that pin when
/// it advances past the leaf, finishes, or is dropped mid-scan. It takes no
/// latches: full scans see a weakly consistent view, and callers wanting a
/// stable one hold table-level locks around the scan.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    leaf: Option<LeafNode<K>>,
    pos: usize,
}

impl<K> BTreeIterator<K> {
    pub(crate) fn new(buffer_pool: Arc<BufferPoolManager>, leaf: LeafNode<K>, pos: usize) -> Self {
        Self {
            buffer_pool,
            leaf: Some(leaf),
            pos,
        }
    }

    pub(crate) fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            leaf: None,
            pos: 0,
        }
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.pos < leaf.entries.len() {
                let entry = leaf.entries[self.pos].clone();
                self.pos += 1;
                return Some(entry);
            }

            // End of this leaf: drop its pin and follow the chain.
            let current = self.leaf.take().expect("leaf is present");
            self.buffer_pool.unpin_page(current.page_id, false);
            self.pos = 0;
            if current.next_page_id == INVALID_PAGE_ID {
                return None;
            }
            let page = match self.buffer_pool.fetch_page(current.next_page_id) {
                Ok(page) => page,
                Err(_) => return None,
            };
            let node = {
                let guard = page.read();
                deserialize_node::<K>(&guard)
            };
            match node {
                Ok(BTreeNode::Leaf(leaf)) => self.leaf = Some(leaf),
                _ => {
                    self.buffer_pool.unpin_page(current.next_page_id, false);
                    return None;
                }
            }
        }
    }
}

impl<K> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            self.buffer_pool.unpin_page(leaf.page_id, false);
        }
    }
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterate from the smallest key.
    pub fn iter(&self) -> Result<BTreeIterator<K>, BTreeError> {
        let mut page_id = *self.root.read();
        if page_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::empty(self.buffer_pool.clone()));
        }
        loop {
            let node = self.fetch_node(page_id)?;
            match node {
                BTreeNode::Internal(internal) => {
                    let child_id = internal.value_at(0);
                    self.buffer_pool.unpin_page(page_id, false);
                    page_id = child_id;
                }
                BTreeNode::Leaf(leaf) => {
                    return Ok(BTreeIterator::new(self.buffer_pool.clone(), leaf, 0));
                }
            }
        }
    }

    /// Iterate starting at the position of `key`: the largest key not above
    /// it, or the front of the leftmost leaf when every key is larger.
    pub fn iter_from(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        let mut page_id = *self.root.read();
        if page_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::empty(self.buffer_pool.clone()));
        }
        loop {
            let node = self.fetch_node(page_id)?;
            match node {
                BTreeNode::Internal(internal) => {
                    let child_id = internal.value_at(internal.child_index(key));
                    self.buffer_pool.unpin_page(page_id, false);
                    page_id = child_id;
                }
                BTreeNode::Leaf(leaf) => {
                    let pos = leaf.slot_of(key).unwrap_or(0);
                    return Ok(BTreeIterator::new(self.buffer_pool.clone(), leaf, pos));
                }
            }
        }
    }
}
