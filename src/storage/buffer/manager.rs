use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::config::EngineConfig;
use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::container::ExtendibleHashTable;
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// Bucket capacity for the page table's directory buckets
const PAGE_TABLE_BUCKET_SIZE: usize = 4;

/// Manages a fixed array of frames caching disk pages.
///
/// Residency is tracked by an extendible hash table mapping page IDs to frame
/// indices; victims are chosen by the LRU-K replacer among unpinned frames.
/// One pool latch serializes frame allocation and the page lifecycle
/// operations; dirty pages reach disk only through `flush_*` or eviction
/// writeback, never on unpin.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FramePtr>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruKReplacer,
    latch: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
}

struct PoolState {
    free_list: VecDeque<FrameId>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let page = Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        Ok(Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            replacer: LruKReplacer::new(pool_size, replacer_k),
            latch: Mutex::new(PoolState { free_list }),
            disk_manager,
        })
    }

    /// Build a pool sized by the engine configuration.
    pub fn with_config(
        config: &EngineConfig,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        Self::new(config.pool_size, config.replacer_k, db_path)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Allocate a fresh page, pinned into a frame with zeroed contents.
    /// Fails with `PoolExhausted` when every frame is pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.latch.lock();
        let frame_id = self.allocate_frame(&mut state)?;
        let page_id = self.disk_manager.allocate_page()?;

        let frame = &self.frames[frame_id as usize];
        {
            let mut frame_guard = frame.write();
            {
                let mut page_guard = frame_guard.page.write();
                page_guard.data.fill(0);
                page_guard.page_id = page_id;
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
        }

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        let page = frame.read().page.clone();
        Ok((page, page_id))
    }

    /// Fetch a page, reading it from disk on a miss. The returned page is
    /// pinned and must be balanced by exactly one `unpin_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut state = self.latch.lock();
        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id as usize];
            {
                let mut frame_guard = frame.write();
                frame_guard.pin_count += 1;
            }
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(frame.read().page.clone());
        }

        let frame_id = self.allocate_frame(&mut state)?;
        let frame = &self.frames[frame_id as usize];
        {
            let mut frame_guard = frame.write();
            {
                let mut page_guard = frame_guard.page.write();
                page_guard.data.fill(0);
                page_guard.page_id = page_id;
                self.disk_manager.read_page(page_id, &mut page_guard)?;
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
        }

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok(frame.read().page.clone())
    }

    /// Drop one pin on the page, OR-ing in the caller's dirty flag. Returns
    /// false when the page is not resident or already unpinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _state = self.latch.lock();
        let frame_id = match self.page_table.find(&page_id) {
            Some(frame_id) => frame_id,
            None => return false,
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        if frame_guard.pin_count == 0 {
            return false;
        }
        frame_guard.pin_count -= 1;
        frame_guard.is_dirty |= is_dirty;
        if frame_guard.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Write the page to disk and clear its dirty flag, regardless of pin
    /// count. Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let _state = self.latch.lock();
        let frame_id = match self.page_table.find(&page_id) {
            Some(frame_id) => frame_id,
            None => return Ok(false),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        {
            let page_guard = frame_guard.page.read();
            self.disk_manager.write_page(&page_guard)?;
        }
        frame_guard.is_dirty = false;
        Ok(true)
    }

    /// Flush every resident page
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let _state = self.latch.lock();
        for frame in &self.frames {
            let mut frame_guard = frame.write();
            let resident = frame_guard.page.read().page_id != INVALID_PAGE_ID;
            if resident {
                {
                    let page_guard = frame_guard.page.read();
                    self.disk_manager.write_page(&page_guard)?;
                }
                frame_guard.is_dirty = false;
            }
        }
        Ok(())
    }

    /// Evict the page from the pool and tell the disk manager to deallocate
    /// it. Succeeds trivially when the page is not resident; returns false
    /// when it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut state = self.latch.lock();
        let frame_id = match self.page_table.find(&page_id) {
            Some(frame_id) => frame_id,
            None => return Ok(true),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        if frame_guard.pin_count > 0 {
            return Ok(false);
        }

        self.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        state.free_list.push_back(frame_id);
        frame_guard.page.write().reset();
        frame_guard.is_dirty = false;
        self.disk_manager.deallocate_page(page_id);
        Ok(true)
    }

    /// Claim a frame from the free list, falling back to eviction. The
    /// evicted occupant is written back if dirty and unmapped.
    fn allocate_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = match self.replacer.evict() {
            Some(frame_id) => frame_id,
            None => return Err(BufferPoolError::PoolExhausted),
        };

        let frame = &self.frames[frame_id as usize];
        let frame_guard = frame.write();
        let old_page_id = frame_guard.page.read().page_id;
        if frame_guard.is_dirty {
            debug!("evicting dirty page {} from frame {}", old_page_id, frame_id);
            let page_guard = frame_guard.page.read();
            self.disk_manager.write_page(&page_guard)?;
        }
        drop(frame_guard);
        if old_page_id != INVALID_PAGE_ID {
            self.page_table.remove(&old_page_id);
        }

        Ok(frame_id)
    }
}
