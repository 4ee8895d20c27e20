use std::sync::Arc;

use anyhow::Result;
use tempfile::NamedTempFile;
use terndb::{BTreeIndex, BufferPoolManager};

mod common;
use common::create_test_buffer_pool;

fn create_test_index(
    leaf_max: usize,
    internal_max: usize,
    pool_size: usize,
) -> Result<(BTreeIndex<i64>, Arc<BufferPoolManager>, NamedTempFile)> {
    let (buffer_pool, temp_file) = create_test_buffer_pool(pool_size, 2)?;
    let index = BTreeIndex::new("test_index", buffer_pool.clone(), leaf_max, internal_max)?;
    Ok((index, buffer_pool, temp_file))
}

#[test]
fn test_insert_and_get() -> Result<()> {
    let (index, _pool, _temp) = create_test_index(4, 4, 16)?;

    assert!(index.is_empty());
    assert!(index.insert(42, 420)?);
    assert!(index.insert(7, 70)?);
    assert_eq!(index.get_value(&42)?, Some(420));
    assert_eq!(index.get_value(&7)?, Some(70));
    assert_eq!(index.get_value(&1)?, None);
    assert_eq!(index.scan_key(&42)?, vec![420]);
    assert!(index.scan_key(&1)?.is_empty());

    Ok(())
}

#[test]
fn test_duplicate_insert_is_rejected() -> Result<()> {
    let (index, _pool, _temp) = create_test_index(4, 4, 16)?;

    assert!(index.insert(5, 50)?);
    assert!(!index.insert(5, 51)?);
    assert_eq!(index.get_value(&5)?, Some(50));

    Ok(())
}

#[test]
fn test_remove_absent_is_noop() -> Result<()> {
    let (index, _pool, _temp) = create_test_index(4, 4, 16)?;

    index.remove(&99)?;
    assert!(index.insert(1, 10)?);
    index.remove(&99)?;
    assert_eq!(index.get_value(&1)?, Some(10));

    Ok(())
}

#[test]
fn test_split_and_iterate() -> Result<()> {
    // Small fanout so five inserts force a root split.
    let (index, _pool, _temp) = create_test_index(3, 3, 16)?;

    for key in 1..=5i64 {
        assert!(index.insert(key, (key * 10) as u32)?);
    }
    assert!(index.depth()? > 1, "root should be internal after splits");

    let entries: Vec<(i64, u32)> = index.iter()?.collect();
    assert_eq!(entries, vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);

    index.remove(&3)?;
    let keys: Vec<i64> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, vec![1, 2, 4, 5]);
    assert_eq!(index.get_value(&3)?, None);
    assert_eq!(index.get_value(&4)?, Some(40));

    Ok(())
}

#[test]
fn test_iter_from_starts_mid_tree() -> Result<()> {
    let (index, _pool, _temp) = create_test_index(3, 3, 16)?;

    for key in [10i64, 20, 30, 40, 50] {
        assert!(index.insert(key, key as u32)?);
    }

    let from_30: Vec<i64> = index.iter_from(&30)?.map(|(k, _)| k).collect();
    assert_eq!(from_30, vec![30, 40, 50]);

    // A key below every entry starts at the front.
    let from_low: Vec<i64> = index.iter_from(&1)?.map(|(k, _)| k).collect();
    assert_eq!(from_low, vec![10, 20, 30, 40, 50]);

    Ok(())
}

#[test]
fn test_randomized_insert_remove_matches_set_semantics() -> Result<()> {
    let (index, _pool, _temp) = create_test_index(4, 4, 32)?;

    // Deterministic permutation of 0..200.
    let keys: Vec<i64> = (0..200).map(|i| (i * 73) % 200).collect();
    for &key in &keys {
        assert!(index.insert(key, key as u32)?);
    }
    for &key in &keys {
        assert_eq!(index.get_value(&key)?, Some(key as u32));
    }

    let sorted: Vec<i64> = index.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (0..200).collect();
    assert_eq!(sorted, expected);

    // Remove the odd keys, in permuted order.
    for &key in keys.iter().filter(|&&k| k % 2 == 1) {
        index.remove(&key)?;
    }
    for key in 0..200i64 {
        let expected = if key % 2 == 0 { Some(key as u32) } else { None };
        assert_eq!(index.get_value(&key)?, expected);
    }
    let survivors: Vec<i64> = index.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (0..200).filter(|k| k % 2 == 0).collect();
    assert_eq!(survivors, expected);

    Ok(())
}

#[test]
fn test_tree_drains_to_empty_and_refills() -> Result<()> {
    let (index, _pool, _temp) = create_test_index(3, 3, 16)?;

    for key in 1..=10i64 {
        assert!(index.insert(key, key as u32)?);
    }
    for key in 1..=10i64 {
        index.remove(&key)?;
    }
    assert!(index.is_empty());
    assert_eq!(index.iter()?.count(), 0);

    assert!(index.insert(3, 33)?);
    assert_eq!(index.get_value(&3)?, Some(33));
    assert_eq!(index.depth()?, 1);

    Ok(())
}

#[test]
fn test_root_recovered_from_header_page() -> Result<()> {
    let (buffer_pool, _temp) = create_test_buffer_pool(16, 2)?;

    {
        let index: BTreeIndex<i64> =
            BTreeIndex::new("orders_pk", buffer_pool.clone(), 4, 4)?;
        for key in 0..50i64 {
            assert!(index.insert(key, key as u32)?);
        }
    }

    // Reopening by name picks the root back up from the header page.
    let reopened: BTreeIndex<i64> = BTreeIndex::new("orders_pk", buffer_pool.clone(), 4, 4)?;
    for key in 0..50i64 {
        assert_eq!(reopened.get_value(&key)?, Some(key as u32));
    }

    // A second index on the same pool gets its own root record.
    let other: BTreeIndex<i64> = BTreeIndex::new("users_pk", buffer_pool, 4, 4)?;
    assert!(other.is_empty());
    assert!(other.insert(1, 1)?);
    assert_eq!(reopened.get_value(&1)?, Some(1));

    Ok(())
}

#[test]
fn test_concurrent_inserts_keep_order() -> Result<()> {
    let (index, _pool, _temp) = create_test_index(8, 8, 64)?;
    let index = Arc::new(index);

    let mut handles = Vec::new();
    for stripe in 0..4i64 {
        let index = index.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..100i64 {
                let key = i * 4 + stripe;
                assert!(index.insert(key, key as u32).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let keys: Vec<i64> = index.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (0..400).collect();
    assert_eq!(keys, expected);

    Ok(())
}
