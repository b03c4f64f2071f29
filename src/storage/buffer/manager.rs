use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::types::{Frame, FrameId, PagePtr, PageId, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_table::PageTable;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// Default K for the LRU-K replacer
const REPLACER_K: usize = 2;

/// Bucket capacity of the page directory
const DIRECTORY_BUCKET_CAPACITY: usize = 8;

/// Page IDs 1.. are handed out by the pool; block 0 is the header page
const FIRST_ALLOCATABLE_PAGE_ID: PageId = 1;

/// The buffer pool: a fixed array of frames caching disk pages, an
/// extendible-hash directory from page ID to frame ID, an LRU-K replacer
/// choosing eviction victims, and a free list of unused frames.
///
/// Frame bookkeeping is serialized by one pool mutex; the directory and the
/// replacer latch themselves below it. Page payloads are guarded by their
/// own reader-writer latches and may be held by callers across pool calls.
pub struct BufferPoolManager {
    pool_size: usize,
    state: Mutex<PoolState>,
    page_table: PageTable,
    replacer: LruKReplacer,
    disk_manager: Arc<DiskManager>,
}

struct PoolState {
    frames: Vec<Frame>,
    free_list: VecDeque<FrameId>,
    next_page_id: PageId,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, REPLACER_K, disk_manager))
    }

    pub fn new_with_k(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, replacer_k, disk_manager))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        replacer_k: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            frames.push(Frame::new(frame_id));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            state: Mutex::new(PoolState {
                frames,
                free_list,
                next_page_id: FIRST_ALLOCATABLE_PAGE_ID,
            }),
            page_table: PageTable::new(DIRECTORY_BUCKET_CAPACITY),
            replacer: LruKReplacer::new(pool_size, replacer_k),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page, pin it and return its zeroed buffer.
    /// Fails with `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self.acquire_frame(&mut state)?;
        let page_id = state.next_page_id;
        state.next_page_id += 1;

        let frame = &mut state.frames[frame_id];
        {
            let mut page = frame.page.write();
            page.reset();
            page.page_id = page_id;
        }
        frame.pin_count = 1;
        frame.is_dirty = false;
        let page_ptr = Arc::clone(&frame.page);

        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
        self.page_table.insert(page_id, frame_id);

        Ok((page_ptr, page_id))
    }

    /// Fetch a page, reading it from disk if it is not resident.
    /// The page comes back pinned; fails with `BufferPoolFull` when it is
    /// not resident and every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::PageNotFound(page_id));
        }

        let mut state = self.state.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &mut state.frames[frame_id];
            frame.pin_count += 1;
            let page_ptr = Arc::clone(&frame.page);
            self.replacer.set_evictable(frame_id, false);
            self.replacer.record_access(frame_id);
            return Ok(page_ptr);
        }

        let frame_id = self.acquire_frame(&mut state)?;
        {
            let frame = &mut state.frames[frame_id];
            let mut page = frame.page.write();
            if let Err(e) = self.disk_manager.read_page(page_id, &mut page) {
                page.reset();
                drop(page);
                state.free_list.push_front(frame_id);
                return Err(e.into());
            }
        }

        let frame = &mut state.frames[frame_id];
        frame.pin_count = 1;
        frame.is_dirty = false;
        let page_ptr = Arc::clone(&frame.page);

        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
        self.page_table.insert(page_id, frame_id);

        Ok(page_ptr)
    }

    /// Drop one pin on a page, OR-ing in the dirty flag. The frame becomes
    /// evictable once its pin count reaches zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let frame = &mut state.frames[frame_id];
        if frame.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        frame.pin_count -= 1;
        if is_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }

        Ok(())
    }

    /// Write a resident page to disk unconditionally and clear its dirty bit.
    ///
    /// The disk write happens outside the pool latch: a caller may hold the
    /// page latch across pool calls, and taking it under the pool latch
    /// would deadlock. The page latch alone keeps id and bytes consistent.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let (frame_id, page_ptr) = {
            let state = self.state.lock();
            let frame_id = self
                .page_table
                .find(&page_id)
                .ok_or(BufferPoolError::PageNotFound(page_id))?;
            (frame_id, Arc::clone(&state.frames[frame_id].page))
        };

        {
            let page = page_ptr.read();
            self.disk_manager.write_page(&page)?;
        }

        let mut state = self.state.lock();
        if self.page_table.find(&page_id) == Some(frame_id) {
            state.frames[frame_id].is_dirty = false;
        }
        Ok(())
    }

    /// Flush every resident page
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let snapshot: Vec<(FrameId, PagePtr)> = {
            let state = self.state.lock();
            state
                .frames
                .iter()
                .map(|frame| (frame.frame_id, Arc::clone(&frame.page)))
                .collect()
        };

        for (frame_id, page_ptr) in snapshot {
            let flushed_id = {
                let page = page_ptr.read();
                if page.page_id == INVALID_PAGE_ID {
                    continue;
                }
                self.disk_manager.write_page(&page)?;
                page.page_id
            };
            let mut state = self.state.lock();
            if self.page_table.find(&flushed_id) == Some(frame_id) {
                state.frames[frame_id].is_dirty = false;
            }
        }
        Ok(())
    }

    /// Drop a page from the pool and return its frame to the free list.
    /// Deleting a non-resident page succeeds; a pinned page is an error.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(());
        };

        if state.frames[frame_id].pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        self.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        {
            let frame = &mut state.frames[frame_id];
            frame.page.write().reset();
            frame.is_dirty = false;
        }
        state.free_list.push_front(frame_id);

        Ok(())
    }

    /// Take a free frame, evicting a victim when the free list is empty.
    /// A dirty victim is written back and its directory entry removed.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.evict().ok_or(BufferPoolError::BufferPoolFull)?;
        let frame = &mut state.frames[frame_id];
        let old_page_id = {
            let page = frame.page.read();
            if frame.is_dirty {
                self.disk_manager.write_page(&page)?;
            }
            page.page_id
        };
        frame.is_dirty = false;
        if old_page_id != INVALID_PAGE_ID {
            debug!("evicting page {} from frame {}", old_page_id, frame_id);
            self.page_table.remove(&old_page_id);
        }

        Ok(frame_id)
    }
}
