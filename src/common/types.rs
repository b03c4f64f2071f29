use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Sentinel meaning "no page"
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Block 0 of the database file; maps index names to root page IDs
pub const HEADER_PAGE_ID: PageId = 0;

/// Buffer pool frame ID type
pub type FrameId = usize;

/// Transaction ID type
pub type TxnId = u32;

/// Sentinel meaning "no transaction"
pub const INVALID_TXN_ID: TxnId = TxnId::MAX;

/// Table object ID type
pub type TableOid = u32;

/// Record ID - identifies a row in a table heap by page and slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot_num)
    }
}

/// Page structure - a fixed-size block of bytes plus its identity
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

    /// Zero the payload and drop the page identity
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }
}

/// Smart pointer to a page; the RwLock is the per-page latch
pub type PagePtr = Arc<RwLock<Page>>;

/// Owned read latch on a page, holdable across call frames
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Owned write latch on a page
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Owned upgradable read latch on a page
pub type PageUpgradableGuard = ArcRwLockUpgradableReadGuard<RawRwLock, Page>;

/// Buffer pool frame metadata; the page payload itself lives behind the
/// page latch, this bookkeeping behind the pool latch
#[derive(Debug)]
pub struct Frame {
    pub page: PagePtr,
    pub frame_id: FrameId,
    pub is_dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
            frame_id,
            is_dirty: false,
            pin_count: 0,
        }
    }
}
