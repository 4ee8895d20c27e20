use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager is responsible for the actual file I/O underneath the buffer
/// pool. Pages are fixed size and page IDs are allocated monotonically by
/// extending the database file, so the allocator state survives restart.
pub struct DiskManager {
    db_file: Mutex<File>,
}

impl DiskManager {
    /// Create a new DiskManager backed by the specified database file
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        Ok(Self {
            db_file: Mutex::new(file),
        })
    }

    /// Read a page from disk. Reading past the end of the file yields a
    /// zeroed page, which callers treat as freshly initialized.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset as u64 >= file_size {
            page.data.fill(0);
            page.page_id = page_id;
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(&mut page.data)?;
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Allocate a new page on disk and return its ID. The first page is 1;
    /// 0 is reserved as the invalid sentinel.
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        let new_page_id = (file_size / PAGE_SIZE as u64) as PageId + 1;

        file.seek(SeekFrom::End(0))?;
        let zeros = [0u8; PAGE_SIZE];
        file.write_all(&zeros)?;
        file.flush()?;

        Ok(new_page_id)
    }

    /// Release a page back to the allocator. Freed pages are not reused yet;
    /// the hook exists so the buffer pool can report deletions.
    pub fn deallocate_page(&self, page_id: PageId) {
        debug!("deallocating page {}", page_id);
    }

    /// Number of pages currently materialized in the database file
    pub fn num_pages(&self) -> Result<u64, DiskManagerError> {
        let file = self.db_file.lock();
        Ok(file.metadata()?.len() / PAGE_SIZE as u64)
    }

    fn page_offset(page_id: PageId) -> usize {
        (page_id as usize - 1) * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_allocate_is_monotonic() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();
        let a = disk.allocate_page().unwrap();
        let b = disk.allocate_page().unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(disk.num_pages().unwrap(), 2);
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();
        let page_id = disk.allocate_page().unwrap();

        let mut page = Page::new(page_id);
        page.data[0..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        disk.write_page(&page).unwrap();

        let mut readback = Page::new(INVALID_PAGE_ID);
        disk.read_page(page_id, &mut readback).unwrap();
        assert_eq!(&readback.data[0..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(readback.page_id, page_id);
    }

    #[test]
    fn test_read_past_eof_zeroes_page() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();
        let mut page = Page::new(INVALID_PAGE_ID);
        page.data.fill(0xff);
        disk.read_page(42, &mut page).unwrap();
        assert!(page.data.iter().all(|&b| b == 0));
        assert_eq!(page.page_id, 42);
    }

    #[test]
    fn test_invalid_page_id_rejected() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();
        let mut page = Page::new(INVALID_PAGE_ID);
        assert!(disk.read_page(INVALID_PAGE_ID, &mut page).is_err());
        assert!(disk.write_page(&page).is_err());
    }
}
