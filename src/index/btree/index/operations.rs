use serde::{Deserialize, Serialize};

use crate::common::types::{PagePtr, PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, InternalNode, LeafNode};
use crate::index::btree::serialization::serialize_node;
use super::base::{BTreeIndex, LatchContext, TreeOp};

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Insert a key-value pair. Returns false (and changes nothing) when the
    /// key already exists.
    pub fn insert(&self, key: K, value: Rid) -> Result<bool, BTreeError> {
        let mut ctx = LatchContext::new(self.root.write_arc());
        let result = self.insert_inner(key, value, &mut ctx);
        if result.is_err() {
            self.release_ancestors(&mut ctx);
        }
        result
    }

    fn insert_inner(
        &self,
        key: K,
        value: Rid,
        ctx: &mut LatchContext,
    ) -> Result<bool, BTreeError> {
        if ctx.root_page_id() == INVALID_PAGE_ID {
            // Empty tree: the first entry becomes a single leaf root.
            let (page, page_id) = self.buffer_pool.new_page()?;
            let result = {
                let mut guard = page.write();
                let mut leaf = LeafNode::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
                leaf.insert(0, key, value);
                serialize_node(&BTreeNode::Leaf(leaf), &mut guard)
            };
            self.buffer_pool.unpin_page(page_id, result.is_ok());
            result?;
            ctx.set_root_page_id(page_id);
            self.update_root_record(page_id)?;
            self.release_ancestors(ctx);
            return Ok(true);
        }

        let (leaf_id, mut guard, mut node) = self.find_leaf_mut(&key, TreeOp::Insert, ctx)?;
        let leaf = match &mut node {
            BTreeNode::Leaf(leaf) => leaf,
            BTreeNode::Internal(_) => unreachable!("descent ends at a leaf"),
        };

        if let Some(pos) = leaf.slot_of(&key) {
            if leaf.key_at(pos) == &key {
                self.release_ancestors(ctx);
                drop(guard);
                self.buffer_pool.unpin_page(leaf_id, false);
                return Ok(false);
            }
        }
        let pos = leaf.slot_of(&key).map_or(0, |p| p + 1);
        leaf.insert(pos, key, value);

        let mut split: Option<(PagePtr, PageId, BTreeNode<K>)> = None;
        if leaf.size() == leaf.max_size {
            let (new_page, new_page_id) = self.buffer_pool.new_page()?;
            let mut new_leaf = LeafNode::new(new_page_id, leaf.parent_page_id, self.leaf_max_size);
            leaf.split(&mut new_leaf);
            split = Some((new_page, new_page_id, BTreeNode::Leaf(new_leaf)));
        }

        match split {
            None => {
                let result = serialize_node(&node, &mut guard);
                self.release_ancestors(ctx);
                drop(guard);
                self.buffer_pool.unpin_page(leaf_id, result.is_ok());
                result?;
                Ok(true)
            }
            Some((new_page, new_page_id, mut right)) => {
                let promoted = right.first_key().clone();
                self.insert_into_parent(&mut node, promoted, &mut right, ctx)?;
                serialize_node(&node, &mut guard)?;
                {
                    let mut new_guard = new_page.write();
                    serialize_node(&right, &mut new_guard)?;
                }
                drop(guard);
                self.buffer_pool.unpin_page(leaf_id, true);
                self.buffer_pool.unpin_page(new_page_id, true);
                Ok(true)
            }
        }
    }

    /// Splice `(key, right)` into the parent of a freshly split node,
    /// growing a new root or splitting the parent in turn as needed.
    fn insert_into_parent(
        &self,
        left: &mut BTreeNode<K>,
        key: K,
        right: &mut BTreeNode<K>,
        ctx: &mut LatchContext,
    ) -> Result<(), BTreeError> {
        if left.parent_page_id() == INVALID_PAGE_ID {
            // The split reached the old root; grow the tree by one level.
            let (root_page, root_id) = self.buffer_pool.new_page()?;
            let mut new_root = InternalNode::new(root_id, INVALID_PAGE_ID, self.internal_max_size);
            new_root.insert(0, left.first_key().clone(), left.page_id());
            new_root.insert(1, key, right.page_id());
            left.set_parent_page_id(root_id);
            right.set_parent_page_id(root_id);
            let result = {
                let mut guard = root_page.write();
                serialize_node(&BTreeNode::Internal(new_root), &mut guard)
            };
            self.buffer_pool.unpin_page(root_id, result.is_ok());
            result?;
            ctx.set_root_page_id(root_id);
            self.update_root_record(root_id)?;
            self.release_ancestors(ctx);
            return Ok(());
        }

        let (parent_id, mut parent_guard) = ctx.latched.pop().expect("parent must be latched");
        debug_assert_eq!(parent_id, left.parent_page_id());
        let mut parent = match super::deserialize_parent::<K>(&parent_guard) {
            Ok(parent) => parent,
            Err(e) => {
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, false);
                return Err(e);
            }
        };

        if parent.size() < parent.max_size {
            let pos = parent.child_index(&key);
            parent.insert(pos + 1, key, right.page_id());
            let result = serialize_node(&BTreeNode::Internal(parent), &mut parent_guard);
            self.release_ancestors(ctx);
            drop(parent_guard);
            self.buffer_pool.unpin_page(parent_id, true);
            return result;
        }

        // Parent is full. Decide which pair ends up in the highest slot: when
        // the incoming key sorts below the parent's last separator, detach
        // that last pair as the end pair and splice the incoming one into the
        // lower half first.
        let (new_page, new_parent_id) = self.buffer_pool.new_page()?;
        let mut new_parent =
            InternalNode::new(new_parent_id, parent.parent_page_id, self.internal_max_size);
        let end_key;
        let end_value;
        if key < *parent.key_at(parent.size() - 1) {
            end_key = parent.key_at(parent.size() - 1).clone();
            end_value = parent.value_at(parent.size() - 1);
            parent.delete(parent.size() - 1);
            let pos = parent.child_index(&key);
            parent.insert(pos + 1, key.clone(), right.page_id());
        } else {
            end_key = key.clone();
            end_value = right.page_id();
        }
        parent.split(&mut new_parent, end_key, end_value);

        // Children moved into the new parent need their back-references
        // updated. The freshly split pair is materialized (and latched) in
        // this call chain, so it is fixed up in memory; everything else is
        // rewritten through the buffer pool.
        for i in 0..new_parent.size() {
            let child_id = new_parent.value_at(i);
            if child_id == left.page_id() {
                left.set_parent_page_id(new_parent_id);
            } else if child_id == right.page_id() {
                right.set_parent_page_id(new_parent_id);
            } else {
                self.reparent(child_id, new_parent_id)?;
            }
        }

        let promoted = new_parent.key_at(0).clone();
        let mut left_half = BTreeNode::Internal(parent);
        let mut right_half = BTreeNode::Internal(new_parent);
        self.insert_into_parent(&mut left_half, promoted, &mut right_half, ctx)?;

        serialize_node(&left_half, &mut parent_guard)?;
        {
            let mut new_guard = new_page.write();
            serialize_node(&right_half, &mut new_guard)?;
        }
        drop(parent_guard);
        self.buffer_pool.unpin_page(parent_id, true);
        self.buffer_pool.unpin_page(new_parent_id, true);
        Ok(())
    }
}
