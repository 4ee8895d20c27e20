//! The header page stores the directory of index roots: a map from index
//! name to root page id, rewritten whenever a tree's root changes.

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::index::btree::error::BTreeError;

/// Look up the root page recorded for an index name.
pub(crate) fn read_root(page: &Page, name: &str) -> Result<Option<PageId>, BTreeError> {
    let records = decode_records(page)?;
    Ok(records.into_iter().find(|(n, _)| n == name).map(|(_, r)| r))
}

/// Insert or update the root record for an index name.
pub(crate) fn write_root(page: &mut Page, name: &str, root: PageId) -> Result<(), BTreeError> {
    let mut records = decode_records(page)?;
    match records.iter_mut().find(|(n, _)| n == name) {
        Some(record) => record.1 = root,
        None => records.push((name.to_string(), root)),
    }

    let body = bincode::serialize(&records)
        .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
    if 4 + body.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }
    LittleEndian::write_u32(&mut page.data[0..4], body.len() as u32);
    page.data[4..4 + body.len()].copy_from_slice(&body);
    Ok(())
}

fn decode_records(page: &Page) -> Result<Vec<(String, PageId)>, BTreeError> {
    let body_len = LittleEndian::read_u32(&page.data[0..4]) as usize;
    if body_len == 0 {
        return Ok(Vec::new());
    }
    if 4 + body_len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }
    bincode::deserialize(&page.data[4..4 + body_len])
        .map_err(|e| BTreeError::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_records_update_in_place() {
        let mut page = Page::new(1);
        assert_eq!(read_root(&page, "orders_pk").unwrap(), None);

        write_root(&mut page, "orders_pk", INVALID_PAGE_ID).unwrap();
        write_root(&mut page, "users_pk", 7).unwrap();
        write_root(&mut page, "orders_pk", 12).unwrap();

        assert_eq!(read_root(&page, "orders_pk").unwrap(), Some(12));
        assert_eq!(read_root(&page, "users_pk").unwrap(), Some(7));
        assert_eq!(read_root(&page, "missing").unwrap(), None);
    }
}
