use std::sync::Arc;

use anyhow::Result;
use tempfile::NamedTempFile;
use terndb::{BufferPoolManager, EngineConfig};

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager backed by a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(
    pool_size: usize,
    replacer_k: usize,
) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let config = EngineConfig {
        pool_size,
        replacer_k,
        ..EngineConfig::default()
    };
    let buffer_pool = Arc::new(BufferPoolManager::with_config(&config, path)?);
    Ok((buffer_pool, file))
}
