use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

/// Page size in bytes (8KB)
pub const PAGE_SIZE: usize = 8192;

/// Page ID type
pub type PageId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Table ID type
pub type TableId = u32;

/// Record ID type
pub type Rid = u32;

/// Sentinel for "no page". Valid page IDs start at 1.
pub const INVALID_PAGE_ID: PageId = 0;

/// The first allocated page; stores the index-name -> root-page directory.
pub const HEADER_PAGE_ID: PageId = 1;

/// Page structure
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the payload and detach the page from any on-disk identity.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }
}

/// Smart pointer to a page. The inner lock doubles as the page latch.
pub type PagePtr = Arc<RwLock<Page>>;

/// Owned page-latch guards; these can be held across stack frames while
/// descending a tree, unlike borrowing guards.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Buffer pool frame structure
#[derive(Debug)]
pub struct Frame {
    pub page: PagePtr,
    pub frame_id: FrameId,
    pub is_dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(frame_id: FrameId, page: PagePtr) -> Self {
        Self {
            page,
            frame_id,
            is_dirty: false,
            pin_count: 0,
        }
    }
}

/// Smart pointer to a frame
pub type FramePtr = Arc<RwLock<Frame>>;
