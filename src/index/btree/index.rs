use serde::Deserialize;

use crate::common::types::Page;
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, InternalNode};
use crate::index::btree::serialization::deserialize_node;

pub mod base;
pub mod deletion;
pub mod iterator;
pub mod operations;

pub use base::BTreeIndex;
pub use iterator::BTreeIterator;

/// Decode a page known to hold an internal node.
pub(crate) fn deserialize_parent<K>(page: &Page) -> Result<InternalNode<K>, BTreeError>
where
    K: for<'de> Deserialize<'de>,
{
    match deserialize_node::<K>(page)? {
        BTreeNode::Internal(node) => Ok(node),
        BTreeNode::Leaf(_) => Err(BTreeError::InvalidPageFormat),
    }
}
