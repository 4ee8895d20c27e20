use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::common::types::{Page, PageId, Rid, INVALID_PAGE_ID, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, InternalNode, LeafNode};

// Node page layout:
// - kind: u8 (1 = leaf, 2 = internal)
// - max_size: u16
// - page_id: u32
// - parent_page_id: u32
// - next_page_id: u32 (leaves only, 0 otherwise)
// - body_len: u32
// - body: bincode-encoded entry array
const KIND_LEAF: u8 = 1;
const KIND_INTERNAL: u8 = 2;
const NODE_HEADER_SIZE: usize = 19;

/// Serialize a B+tree node into a page's bytes.
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize,
{
    let (kind, max_size, page_id, parent_page_id, next_page_id, body) = match node {
        BTreeNode::Leaf(leaf) => {
            let body = bincode::serialize(&leaf.entries)
                .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
            (
                KIND_LEAF,
                leaf.max_size,
                leaf.page_id,
                leaf.parent_page_id,
                leaf.next_page_id,
                body,
            )
        }
        BTreeNode::Internal(internal) => {
            let body = bincode::serialize(&internal.entries)
                .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
            (
                KIND_INTERNAL,
                internal.max_size,
                internal.page_id,
                internal.parent_page_id,
                INVALID_PAGE_ID,
                body,
            )
        }
    };

    if NODE_HEADER_SIZE + body.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }

    page.data.fill(0);
    page.data[0] = kind;
    LittleEndian::write_u16(&mut page.data[1..3], max_size as u16);
    LittleEndian::write_u32(&mut page.data[3..7], page_id);
    LittleEndian::write_u32(&mut page.data[7..11], parent_page_id);
    LittleEndian::write_u32(&mut page.data[11..15], next_page_id);
    LittleEndian::write_u32(&mut page.data[15..19], body.len() as u32);
    page.data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + body.len()].copy_from_slice(&body);
    Ok(())
}

/// Deserialize a B+tree node from a page's bytes.
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: for<'de> Deserialize<'de>,
{
    let kind = page.data[0];
    let max_size = LittleEndian::read_u16(&page.data[1..3]) as usize;
    let page_id: PageId = LittleEndian::read_u32(&page.data[3..7]);
    let parent_page_id: PageId = LittleEndian::read_u32(&page.data[7..11]);
    let next_page_id: PageId = LittleEndian::read_u32(&page.data[11..15]);
    let body_len = LittleEndian::read_u32(&page.data[15..19]) as usize;

    if NODE_HEADER_SIZE + body_len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }
    let body = &page.data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + body_len];

    match kind {
        KIND_LEAF => {
            let entries: Vec<(K, Rid)> = bincode::deserialize(body)
                .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
            Ok(BTreeNode::Leaf(LeafNode {
                page_id,
                parent_page_id,
                max_size,
                next_page_id,
                entries,
            }))
        }
        KIND_INTERNAL => {
            let entries: Vec<(K, PageId)> = bincode::deserialize(body)
                .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
            Ok(BTreeNode::Internal(InternalNode {
                page_id,
                parent_page_id,
                max_size,
                entries,
            }))
        }
        _ => Err(BTreeError::InvalidPageFormat),
    }
}
