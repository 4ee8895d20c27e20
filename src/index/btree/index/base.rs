use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

use crate::common::types::{
    PageId, PageReadGuard, PageWriteGuard, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use crate::index::btree::error::BTreeError;
use crate::index::btree::header;
use crate::index::btree::node::{BTreeNode, LeafNode};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};

pub(crate) type RootGuard = ArcRwLockWriteGuard<RawRwLock, PageId>;

/// Which kind of write traversal is running; decides the safe-node test
/// that lets ancestors be unlatched early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeOp {
    Insert,
    Delete,
}

/// Latches and pins one write operation holds while descending: the root
/// latch (acting as the sentinel above the topmost page) plus the latched
/// ancestor pages, in root-to-leaf order. Pages emptied by merges accumulate
/// in `deleted` and go back to the buffer pool after all latches drop.
///
/// `pending_reparents` carries parent-pointer fixups for pages that are
/// latched (and materialized) by an enclosing stack frame; that frame applies
/// them to its in-memory node instead of the page being re-latched here.
pub(crate) struct LatchContext {
    pub(crate) root_guard: Option<RootGuard>,
    pub(crate) latched: Vec<(PageId, PageWriteGuard)>,
    pub(crate) deleted: Vec<PageId>,
    pub(crate) pending_reparents: Vec<(PageId, PageId)>,
}

impl LatchContext {
    pub(crate) fn new(root_guard: RootGuard) -> Self {
        Self {
            root_guard: Some(root_guard),
            latched: Vec::new(),
            deleted: Vec::new(),
            pending_reparents: Vec::new(),
        }
    }

    /// Claim the recorded new parent for a page this frame holds, if any.
    pub(crate) fn take_pending_reparent(&mut self, page_id: PageId) -> Option<PageId> {
        let pos = self
            .pending_reparents
            .iter()
            .position(|&(child, _)| child == page_id)?;
        Some(self.pending_reparents.remove(pos).1)
    }

    pub(crate) fn root_page_id(&self) -> PageId {
        **self.root_guard.as_ref().expect("root latch must be held")
    }

    pub(crate) fn set_root_page_id(&mut self, page_id: PageId) {
        **self.root_guard.as_mut().expect("root latch must be held") = page_id;
    }
}

/// B+tree index over the buffer pool.
///
/// Keys are unique; values are record ids. The root page id is guarded by a
/// tree-wide read-write latch and mirrored into the header page whenever it
/// changes, so the tree can be reopened by name.
pub struct BTreeIndex<K> {
    name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root: Arc<RwLock<PageId>>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    _phantom: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Open (or register) the named index, recovering its root from the
    /// header page when one was recorded before.
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 2, "leaf_max_size too small");
        assert!(internal_max_size >= 3, "internal_max_size too small");
        let name = name.into();

        let materialized = buffer_pool
            .disk_manager()
            .num_pages()
            .map_err(BufferPoolError::from)?;

        let root_page_id = if materialized == 0 {
            let (page, page_id) = buffer_pool.new_page()?;
            debug_assert_eq!(page_id, HEADER_PAGE_ID);
            let result = {
                let mut guard = page.write();
                header::write_root(&mut guard, &name, INVALID_PAGE_ID)
            };
            buffer_pool.unpin_page(page_id, result.is_ok());
            result?;
            INVALID_PAGE_ID
        } else {
            let page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
            let existing = {
                let guard = page.read();
                header::read_root(&guard, &name)
            };
            match existing {
                Ok(Some(root)) => {
                    buffer_pool.unpin_page(HEADER_PAGE_ID, false);
                    root
                }
                Ok(None) => {
                    let result = {
                        let mut guard = page.write();
                        header::write_root(&mut guard, &name, INVALID_PAGE_ID)
                    };
                    buffer_pool.unpin_page(HEADER_PAGE_ID, result.is_ok());
                    result?;
                    INVALID_PAGE_ID
                }
                Err(e) => {
                    buffer_pool.unpin_page(HEADER_PAGE_ID, false);
                    return Err(e);
                }
            }
        };

        Ok(Self {
            name,
            buffer_pool,
            root: Arc::new(RwLock::new(root_page_id)),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root.read()
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let found = self.find_leaf_read(key)?;
        let (page_id, guard, leaf) = match found {
            Some(found) => found,
            None => return Ok(None),
        };
        let result = match leaf.slot_of(key) {
            Some(pos) if leaf.key_at(pos) == key => Some(leaf.value_at(pos)),
            _ => None,
        };
        drop(guard);
        self.buffer_pool.unpin_page(page_id, false);
        Ok(result)
    }

    /// Executor-facing lookup: every record id filed under the key. The
    /// index is unique, so the result holds at most one entry.
    pub fn scan_key(&self, key: &K) -> Result<Vec<Rid>, BTreeError> {
        Ok(self.get_value(key)?.into_iter().collect())
    }

    /// Number of levels on the leftmost path; zero for an empty tree.
    pub fn depth(&self) -> Result<usize, BTreeError> {
        let mut page_id = *self.root.read();
        if page_id == INVALID_PAGE_ID {
            return Ok(0);
        }
        let mut depth = 0;
        loop {
            let node = self.fetch_node(page_id)?;
            depth += 1;
            let next = match &node {
                BTreeNode::Leaf(_) => None,
                BTreeNode::Internal(internal) => Some(internal.value_at(0)),
            };
            self.buffer_pool.unpin_page(page_id, false);
            match next {
                Some(child_id) => page_id = child_id,
                None => return Ok(depth),
            }
        }
    }

    /// Search descent with read crabbing: latch the child, then release the
    /// parent's latch and pin. The root latch is dropped as soon as the root
    /// page itself is latched.
    pub(crate) fn find_leaf_read(
        &self,
        key: &K,
    ) -> Result<Option<(PageId, PageReadGuard, LeafNode<K>)>, BTreeError> {
        let root_guard = self.root.read_arc();
        let mut page_id = *root_guard;
        if page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let page = self.buffer_pool.fetch_page(page_id)?;
        let mut guard = page.read_arc();
        drop(root_guard);

        loop {
            let node = match deserialize_node::<K>(&guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    self.buffer_pool.unpin_page(page_id, false);
                    return Err(e);
                }
            };
            match node {
                BTreeNode::Leaf(leaf) => return Ok(Some((page_id, guard, leaf))),
                BTreeNode::Internal(internal) => {
                    let child_id = internal.value_at(internal.child_index(key));
                    let child_page = match self.buffer_pool.fetch_page(child_id) {
                        Ok(page) => page,
                        Err(e) => {
                            drop(guard);
                            self.buffer_pool.unpin_page(page_id, false);
                            return Err(e.into());
                        }
                    };
                    let child_guard = child_page.read_arc();
                    drop(guard);
                    self.buffer_pool.unpin_page(page_id, false);
                    page_id = child_id;
                    guard = child_guard;
                }
            }
        }
    }

    /// Write descent with latch crabbing: ancestors stay latched in the
    /// context until a safe child proves no structure modification can reach
    /// them, at which point all of them (and the root latch) are released.
    pub(crate) fn find_leaf_mut(
        &self,
        key: &K,
        op: TreeOp,
        ctx: &mut LatchContext,
    ) -> Result<(PageId, PageWriteGuard, BTreeNode<K>), BTreeError> {
        let mut page_id = ctx.root_page_id();
        let page = self.buffer_pool.fetch_page(page_id)?;
        let mut guard = page.write_arc();
        let mut node = match deserialize_node::<K>(&guard) {
            Ok(node) => node,
            Err(e) => {
                drop(guard);
                self.buffer_pool.unpin_page(page_id, false);
                return Err(e);
            }
        };
        if Self::is_safe(&node, op, true) {
            self.release_ancestors(ctx);
        }

        loop {
            let child_id = match &node {
                BTreeNode::Leaf(_) => break,
                BTreeNode::Internal(internal) => internal.value_at(internal.child_index(key)),
            };
            let child_page = match self.buffer_pool.fetch_page(child_id) {
                Ok(page) => page,
                Err(e) => {
                    ctx.latched.push((page_id, guard));
                    return Err(e.into());
                }
            };
            let child_guard = child_page.write_arc();
            let child_node = match deserialize_node::<K>(&child_guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(child_guard);
                    self.buffer_pool.unpin_page(child_id, false);
                    ctx.latched.push((page_id, guard));
                    return Err(e);
                }
            };
            ctx.latched.push((page_id, guard));
            if Self::is_safe(&child_node, op, false) {
                self.release_ancestors(ctx);
            }
            page_id = child_id;
            guard = child_guard;
            node = child_node;
        }
        Ok((page_id, guard, node))
    }

    /// A node is safe when the pending operation cannot propagate a
    /// structure modification above it.
    fn is_safe(node: &BTreeNode<K>, op: TreeOp, is_root: bool) -> bool {
        match op {
            TreeOp::Insert => node.size() + usize::from(node.is_leaf()) < node.max_size(),
            TreeOp::Delete => {
                if is_root {
                    node.size() > 2
                } else {
                    node.size() > node.min_size()
                }
            }
        }
    }

    /// Unlatch and unpin every held ancestor, root latch included.
    pub(crate) fn release_ancestors(&self, ctx: &mut LatchContext) {
        ctx.root_guard = None;
        for (page_id, guard) in ctx.latched.drain(..) {
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false);
        }
    }

    /// Fetch and decode a node, keeping the pin on success.
    pub(crate) fn fetch_node(&self, page_id: PageId) -> Result<BTreeNode<K>, BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        let result = {
            let guard = page.read();
            deserialize_node::<K>(&guard)
        };
        if result.is_err() {
            self.buffer_pool.unpin_page(page_id, false);
        }
        result
    }

    /// Rewrite a child's parent back-reference.
    pub(crate) fn reparent(&self, child_id: PageId, parent_id: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(child_id)?;
        let result = {
            let mut guard = page.write();
            deserialize_node::<K>(&guard).and_then(|mut node| {
                node.set_parent_page_id(parent_id);
                serialize_node(&node, &mut guard)
            })
        };
        self.buffer_pool.unpin_page(child_id, result.is_ok());
        result
    }

    /// Mirror a root change into the header page record for this index.
    pub(crate) fn update_root_record(&self, root: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let result = {
            let mut guard = page.write();
            header::write_root(&mut guard, &self.name, root)
        };
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, result.is_ok());
        result
    }
}
