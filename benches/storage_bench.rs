use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use terndb::{BTreeIndex, BufferPoolManager};

// Create a buffer pool over a throwaway database file
fn create_test_buffer_pool(pool_size: usize) -> Arc<BufferPoolManager> {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, 2, path).unwrap());

    // Keep the temp file alive
    std::mem::forget(temp_file);

    buffer_pool
}

fn buffer_pool_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BufferPool");

    for size in [16usize, 64, 256].iter() {
        group.bench_with_input(BenchmarkId::new("fetch_unpin", size), size, |b, &size| {
            let buffer_pool = create_test_buffer_pool(size);

            let mut page_ids = Vec::new();
            for _ in 0..size {
                let (page, page_id) = buffer_pool.new_page().unwrap();
                {
                    let mut page_guard = page.write();
                    page_guard.data[0] = (page_id % 251) as u8;
                }
                buffer_pool.unpin_page(page_id, true);
                page_ids.push(page_id);
            }

            b.iter(|| {
                for &page_id in &page_ids {
                    let page = buffer_pool.fetch_page(page_id).unwrap();
                    {
                        let _page_guard = page.read();
                    }
                    buffer_pool.unpin_page(page_id, false);
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("random_fetch", size), size, |b, &size| {
            let buffer_pool = create_test_buffer_pool(size);

            // Twice as many pages as frames so the replacer stays busy.
            let mut page_ids = Vec::new();
            for _ in 0..size * 2 {
                let (_, page_id) = buffer_pool.new_page().unwrap();
                buffer_pool.unpin_page(page_id, false);
                page_ids.push(page_id);
            }

            let mut rng = StdRng::seed_from_u64(0xfeed);
            b.iter(|| {
                let page_id = *page_ids.choose(&mut rng).unwrap();
                let _page = buffer_pool.fetch_page(page_id).unwrap();
                buffer_pool.unpin_page(page_id, false);
            });
        });
    }

    group.finish();
}

fn btree_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BTreeIndex");

    group.bench_function("insert_10k", |b| {
        b.iter_with_setup(
            || {
                let buffer_pool = create_test_buffer_pool(256);
                let index: BTreeIndex<i64> =
                    BTreeIndex::new("bench_insert", buffer_pool, 64, 64).unwrap();
                let mut keys: Vec<i64> = (0..10_000).collect();
                keys.shuffle(&mut StdRng::seed_from_u64(0xbeef));
                (index, keys)
            },
            |(index, keys)| {
                for key in keys {
                    index.insert(key, key as u32).unwrap();
                }
            },
        );
    });

    group.bench_function("get_10k", |b| {
        let buffer_pool = create_test_buffer_pool(256);
        let index: BTreeIndex<i64> = BTreeIndex::new("bench_get", buffer_pool, 64, 64).unwrap();
        let mut keys: Vec<i64> = (0..10_000).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(0xbeef));
        for &key in &keys {
            index.insert(key, key as u32).unwrap();
        }

        let mut rng = StdRng::seed_from_u64(0xdead);
        b.iter(|| {
            let key = *keys.choose(&mut rng).unwrap();
            assert!(index.get_value(&key).unwrap().is_some());
        });
    });

    group.finish();
}

criterion_group!(benches, buffer_pool_benchmark, btree_benchmark);
criterion_main!(benches);
