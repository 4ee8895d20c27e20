use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, InternalNode};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use super::base::{BTreeIndex, LatchContext, TreeOp};

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Delete the entry for a key. Absent keys are a silent no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut ctx = LatchContext::new(self.root.write_arc());
        let result = self.remove_inner(key, &mut ctx);
        if result.is_err() {
            self.release_ancestors(&mut ctx);
        }
        result
    }

    fn remove_inner(&self, key: &K, ctx: &mut LatchContext) -> Result<(), BTreeError> {
        if ctx.root_page_id() == INVALID_PAGE_ID {
            self.release_ancestors(ctx);
            return Ok(());
        }

        let (leaf_id, mut guard, mut node) = self.find_leaf_mut(key, TreeOp::Delete, ctx)?;
        {
            let leaf = match &mut node {
                BTreeNode::Leaf(leaf) => leaf,
                BTreeNode::Internal(_) => unreachable!("descent ends at a leaf"),
            };
            match leaf.slot_of(key) {
                Some(pos) if leaf.key_at(pos) == key => leaf.delete(pos),
                _ => {
                    self.release_ancestors(ctx);
                    drop(guard);
                    self.buffer_pool.unpin_page(leaf_id, false);
                    return Ok(());
                }
            }
        }

        let leaf_deleted = self.coalesce_or_redistribute(&mut node, key, None, ctx)?;
        if leaf_deleted {
            ctx.deleted.push(leaf_id);
        }
        debug_assert!(ctx.pending_reparents.is_empty());

        let result = serialize_node(&node, &mut guard);
        drop(guard);
        self.buffer_pool.unpin_page(leaf_id, true);
        result?;

        for page_id in std::mem::take(&mut ctx.deleted) {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }

    /// Restore the size invariant of an underflowing node, preferring to
    /// borrow from the left sibling and merging when borrowing is not
    /// possible. `held_descendant` names the child of `node` whose page the
    /// caller keeps latched, so its parent pointer is fixed up through the
    /// context rather than through the buffer pool. Returns true when `node`
    /// was absorbed into a sibling and its page should be reclaimed.
    fn coalesce_or_redistribute(
        &self,
        node: &mut BTreeNode<K>,
        search_key: &K,
        held_descendant: Option<PageId>,
        ctx: &mut LatchContext,
    ) -> Result<bool, BTreeError> {
        if node.parent_page_id() == INVALID_PAGE_ID {
            return match node {
                BTreeNode::Internal(root) if root.size() == 1 => {
                    // Collapse the root: its sole child (the merge survivor
                    // latched below us) takes over.
                    let child_id = root.value_at(0);
                    debug_assert_eq!(Some(child_id), held_descendant);
                    ctx.set_root_page_id(child_id);
                    self.update_root_record(child_id)?;
                    ctx.pending_reparents.push((child_id, INVALID_PAGE_ID));
                    self.release_ancestors(ctx);
                    Ok(true)
                }
                BTreeNode::Leaf(root) if root.size() == 0 => {
                    ctx.set_root_page_id(INVALID_PAGE_ID);
                    self.update_root_record(INVALID_PAGE_ID)?;
                    self.release_ancestors(ctx);
                    Ok(true)
                }
                _ => {
                    self.release_ancestors(ctx);
                    Ok(false)
                }
            };
        }

        if node.size() >= node.min_size() {
            self.release_ancestors(ctx);
            return Ok(false);
        }

        let (parent_id, mut parent_guard) = ctx.latched.pop().expect("parent must be latched");
        let mut parent = match super::deserialize_parent::<K>(&parent_guard) {
            Ok(parent) => parent,
            Err(e) => {
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, false);
                return Err(e);
            }
        };
        let pos = parent.child_index(search_key);
        debug_assert_eq!(parent.value_at(pos), node.page_id());

        if pos > 0 {
            // Borrow from, or merge into, the left sibling.
            let left_id = parent.value_at(pos - 1);
            let left_page = self.buffer_pool.fetch_page(left_id)?;
            let mut left_guard = left_page.write_arc();
            let mut left = match deserialize_node::<K>(&left_guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(left_guard);
                    self.buffer_pool.unpin_page(left_id, false);
                    drop(parent_guard);
                    self.buffer_pool.unpin_page(parent_id, false);
                    return Err(e);
                }
            };

            if left.size() > left.min_size() {
                self.redistribute_from_left(&mut left, node, &mut parent, pos)?;
                let result = serialize_node(&BTreeNode::Internal(parent), &mut parent_guard)
                    .and_then(|_| serialize_node(&left, &mut left_guard));
                self.release_ancestors(ctx);
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true);
                drop(left_guard);
                self.buffer_pool.unpin_page(left_id, true);
                result?;
                return Ok(false);
            }

            let merge_key = parent.key_at(pos).clone();
            self.merge_nodes(&mut left, node, merge_key, held_descendant, ctx)?;
            parent.delete(pos);

            let mut parent_node = BTreeNode::Internal(parent);
            let parent_deleted = self.coalesce_or_redistribute(
                &mut parent_node,
                search_key,
                Some(left.page_id()),
                ctx,
            )?;
            if let Some(new_parent) = ctx.take_pending_reparent(left.page_id()) {
                left.set_parent_page_id(new_parent);
            }
            if parent_deleted {
                ctx.deleted.push(parent_id);
            }

            let result = serialize_node(&parent_node, &mut parent_guard)
                .and_then(|_| serialize_node(&left, &mut left_guard));
            drop(parent_guard);
            self.buffer_pool.unpin_page(parent_id, true);
            drop(left_guard);
            self.buffer_pool.unpin_page(left_id, true);
            result?;
            return Ok(true);
        }

        if pos + 1 < parent.size() {
            // Leftmost child: work with the right sibling instead.
            let right_id = parent.value_at(pos + 1);
            let right_page = self.buffer_pool.fetch_page(right_id)?;
            let mut right_guard = right_page.write_arc();
            let mut right = match deserialize_node::<K>(&right_guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(right_guard);
                    self.buffer_pool.unpin_page(right_id, false);
                    drop(parent_guard);
                    self.buffer_pool.unpin_page(parent_id, false);
                    return Err(e);
                }
            };

            if right.size() > right.min_size() {
                self.redistribute_from_right(node, &mut right, &mut parent, pos + 1)?;
                let result = serialize_node(&BTreeNode::Internal(parent), &mut parent_guard)
                    .and_then(|_| serialize_node(&right, &mut right_guard));
                self.release_ancestors(ctx);
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true);
                drop(right_guard);
                self.buffer_pool.unpin_page(right_id, true);
                result?;
                return Ok(false);
            }

            ctx.deleted.push(right_id);
            let merge_key = parent.key_at(pos + 1).clone();
            self.merge_nodes(node, &mut right, merge_key, held_descendant, ctx)?;
            parent.delete(pos + 1);

            let mut parent_node = BTreeNode::Internal(parent);
            let parent_deleted = self.coalesce_or_redistribute(
                &mut parent_node,
                search_key,
                Some(node.page_id()),
                ctx,
            )?;
            if let Some(new_parent) = ctx.take_pending_reparent(node.page_id()) {
                node.set_parent_page_id(new_parent);
            }
            if parent_deleted {
                ctx.deleted.push(parent_id);
            }

            let result = serialize_node(&parent_node, &mut parent_guard)
                .and_then(|_| serialize_node(&right, &mut right_guard));
            drop(parent_guard);
            self.buffer_pool.unpin_page(parent_id, true);
            drop(right_guard);
            self.buffer_pool.unpin_page(right_id, true);
            result?;
            return Ok(false);
        }

        // Only child of its parent; nothing to borrow or merge with.
        self.release_ancestors(ctx);
        drop(parent_guard);
        self.buffer_pool.unpin_page(parent_id, false);
        Ok(false)
    }

    /// Move one entry from the left sibling into `node` and refresh the
    /// separator between them.
    fn redistribute_from_left(
        &self,
        left: &mut BTreeNode<K>,
        node: &mut BTreeNode<K>,
        parent: &mut InternalNode<K>,
        pos: usize,
    ) -> Result<(), BTreeError> {
        match (&mut *left, &mut *node) {
            (BTreeNode::Leaf(left), BTreeNode::Leaf(node)) => {
                left.shift_to(node);
                parent.set_key_at(pos, node.key_at(0).clone());
                Ok(())
            }
            (BTreeNode::Internal(left), BTreeNode::Internal(node)) => {
                let moved = left.shift_to(node);
                self.reparent(moved, node.page_id)?;
                parent.set_key_at(pos, node.key_at(0).clone());
                Ok(())
            }
            _ => unreachable!("siblings share a node kind"),
        }
    }

    /// Move one entry from the right sibling into `node` and refresh the
    /// separator between them.
    fn redistribute_from_right(
        &self,
        node: &mut BTreeNode<K>,
        right: &mut BTreeNode<K>,
        parent: &mut InternalNode<K>,
        right_pos: usize,
    ) -> Result<(), BTreeError> {
        match (&mut *node, &mut *right) {
            (BTreeNode::Leaf(node), BTreeNode::Leaf(right)) => {
                node.shift_from(right);
                parent.set_key_at(right_pos, right.key_at(0).clone());
                Ok(())
            }
            (BTreeNode::Internal(node), BTreeNode::Internal(right)) => {
                let moved = node.shift_from(right);
                self.reparent(moved, node.page_id)?;
                parent.set_key_at(right_pos, right.key_at(0).clone());
                Ok(())
            }
            _ => unreachable!("siblings share a node kind"),
        }
    }

    /// Concatenate `right` into `left`. Internal merges demote the parent
    /// separator into the seam and reparent the moved children; the child
    /// latched by the caller chain is deferred through the context.
    fn merge_nodes(
        &self,
        left: &mut BTreeNode<K>,
        right: &mut BTreeNode<K>,
        merge_key: K,
        held_descendant: Option<PageId>,
        ctx: &mut LatchContext,
    ) -> Result<(), BTreeError> {
        match (&mut *left, &mut *right) {
            (BTreeNode::Leaf(left), BTreeNode::Leaf(right)) => {
                left.merge(right);
                Ok(())
            }
            (BTreeNode::Internal(left), BTreeNode::Internal(right)) => {
                for i in 0..right.size() {
                    let child_id = right.value_at(i);
                    if Some(child_id) == held_descendant {
                        ctx.pending_reparents.push((child_id, left.page_id));
                    } else {
                        self.reparent(child_id, left.page_id)?;
                    }
                }
                left.merge(right, merge_key);
                Ok(())
            }
            _ => unreachable!("siblings share a node kind"),
        }
    }
}
