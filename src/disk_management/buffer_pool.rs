use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, error};

use crate::common::rw_latch::RwLatch;
use crate::extendible_hashing::extendible_hashing::ExtendibleHashTable;

use super::disk_manager::DiskManager;
use super::lru_replacer::LruReplacer;

pub const PAGE_SIZE: usize = 4096;

pub type PageId = u32;
pub type FrameId = usize;

pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// A frame of the buffer pool: one page worth of data plus the metadata the
/// pool needs to manage it. Frames are handed out as `Arc<Page>` and stay
/// alive for the lifetime of the pool; their contents rotate as pages are
/// evicted and loaded.
///
/// The data sits behind its own `RwLock`; the separate [`RwLatch`] is the
/// logical page latch that index code holds across calls while crab-latching.
pub struct Page {
    data: RwLock<[u8; PAGE_SIZE]>,
    latch: RwLatch,
    page_id: AtomicU32,
    pin_count: AtomicI32,
    is_dirty: AtomicBool,
}

impl Page {
    fn new() -> Page {
        Page {
            data: RwLock::new([0; PAGE_SIZE]),
            latch: RwLatch::new(),
            page_id: AtomicU32::new(INVALID_PAGE_ID),
            pin_count: AtomicI32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id.load(Ordering::Acquire)
    }

    pub fn pin_count(&self) -> i32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn read_data(&self) -> RwLockReadGuard<'_, [u8; PAGE_SIZE]> {
        self.data.read().expect("page data lock poisoned")
    }

    pub fn write_data(&self) -> RwLockWriteGuard<'_, [u8; PAGE_SIZE]> {
        self.data.write().expect("page data lock poisoned")
    }

    pub fn r_latch(&self) {
        self.latch.r_lock();
    }

    pub fn r_unlatch(&self) {
        self.latch.r_unlock();
    }

    pub fn w_latch(&self) {
        self.latch.w_lock();
    }

    pub fn w_unlatch(&self) {
        self.latch.w_unlock();
    }

    /// Returns the frame to its pristine state. Only called by the pool on
    /// frames nobody holds a pin on.
    fn reset(&self) {
        self.write_data().fill(0);
        self.page_id.store(INVALID_PAGE_ID, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
    }
}

/// Caches fixed-size disk pages in a fixed set of frames and mediates every
/// page access. A page with a pin count above zero is never evicted; a page
/// whose pin count drops to zero becomes a candidate for the LRU replacer.
///
/// Every operation acquires the single pool latch for its whole body; each
/// body is O(1) outside the disk path, so a finer scheme would buy little.
pub struct BufferPool {
    pool_size: usize,
    file_manager: Arc<Mutex<DiskManager>>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    frames: Vec<Arc<Page>>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    lru_replacer: LruReplacer,
    free_list: VecDeque<FrameId>,
}

impl BufferPool {
    pub fn new(pool_size: usize, file_manager: Arc<Mutex<DiskManager>>) -> BufferPool {
        BufferPool {
            pool_size,
            file_manager,
            inner: Mutex::new(PoolInner {
                frames: (0..pool_size).map(|_| Arc::new(Page::new())).collect(),
                page_table: ExtendibleHashTable::default(),
                lru_replacer: LruReplacer::new(pool_size),
                free_list: (0..pool_size).collect(),
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of pages currently allocated in the database file.
    pub fn num_disk_pages(&self) -> u64 {
        self.file_manager
            .lock()
            .expect("disk manager lock poisoned")
            .num_pages()
            .unwrap_or(0)
    }

    /// Returns the requested page pinned once more than before, loading it
    /// from disk into a victim frame on a miss. [None] means every frame is
    /// pinned or the disk failed.
    pub fn fetch_page(&self, page_id: PageId) -> Option<Arc<Page>> {
        let mut inner = self.lock_inner();

        if let Some(frame_id) = inner.page_table.find(&page_id) {
            let page = inner.frames[frame_id].clone();
            page.pin_count.fetch_add(1, Ordering::AcqRel);
            inner.lru_replacer.drop_frame(frame_id);
            return Some(page);
        }

        let frame_id = Self::get_victim(&mut inner)?;
        let page = inner.frames[frame_id].clone();
        let old_page_id = page.page_id();

        if page.is_dirty() {
            debug!("evicting dirty page {} from frame {}", old_page_id, frame_id);
            let data = page.read_data();
            if let Err(e) = self.write_to_disk(old_page_id, &data) {
                error!("could not write back page {}: {}", old_page_id, e);
                drop(data);
                Self::requeue_victim(&mut inner, frame_id, old_page_id);
                return None;
            }
            page.is_dirty.store(false, Ordering::Release);
        }

        if old_page_id != INVALID_PAGE_ID {
            inner.page_table.remove(&old_page_id);
        }
        inner.page_table.insert(page_id, frame_id);

        {
            let mut data = page.write_data();
            if let Err(e) = self
                .file_manager
                .lock()
                .expect("disk manager lock poisoned")
                .read_page(page_id, &mut data)
            {
                error!("could not read page {}: {}", page_id, e);
                drop(data);
                inner.page_table.remove(&page_id);
                page.reset();
                inner.free_list.push_back(frame_id);
                return None;
            }
        }

        page.page_id.store(page_id, Ordering::Release);
        page.pin_count.store(1, Ordering::Release);
        page.is_dirty.store(false, Ordering::Release);
        Some(page)
    }

    /// Releases one pin. The dirty flag is sticky: unpinning clean never
    /// clears a dirty bit set by an earlier unpin. Returns false when the
    /// page is not cached or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut inner = self.lock_inner();
        let frame_id = match inner.page_table.find(&page_id) {
            Some(frame_id) => frame_id,
            None => return false,
        };
        let page = inner.frames[frame_id].clone();
        if is_dirty {
            page.is_dirty.store(true, Ordering::Release);
        }
        if page.pin_count() <= 0 {
            return false;
        }
        if page.pin_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            inner.lru_replacer.add_frame(frame_id);
        }
        true
    }

    /// Writes a cached page to disk if it is dirty. Returns false when the
    /// page is not cached.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        let inner = self.lock_inner();
        if page_id == INVALID_PAGE_ID {
            return false;
        }
        let frame_id = match inner.page_table.find(&page_id) {
            Some(frame_id) => frame_id,
            None => return false,
        };
        let page = inner.frames[frame_id].clone();
        if page.is_dirty() {
            let data = page.read_data();
            if let Err(e) = self.write_to_disk(page_id, &data) {
                error!("could not flush page {}: {}", page_id, e);
                return false;
            }
            page.is_dirty.store(false, Ordering::Release);
        }
        true
    }

    /// Writes every dirty resident page to disk. Pages stay cached and
    /// pinned pages are untouched besides the write-back.
    pub fn flush_all_pages(&self) {
        let inner = self.lock_inner();
        for page in &inner.frames {
            let page_id = page.page_id();
            if page_id != INVALID_PAGE_ID && page.is_dirty() {
                let data = page.read_data();
                match self.write_to_disk(page_id, &data) {
                    Ok(()) => page.is_dirty.store(false, Ordering::Release),
                    Err(e) => error!("could not flush page {}: {}", page_id, e),
                }
            }
        }
    }

    /// Allocates a fresh disk page and returns it zeroed, pinned once, in a
    /// victim frame. [None] means every frame is pinned or the disk failed.
    pub fn new_page(&self) -> Option<(PageId, Arc<Page>)> {
        let mut inner = self.lock_inner();

        let frame_id = Self::get_victim(&mut inner)?;
        let page = inner.frames[frame_id].clone();
        let old_page_id = page.page_id();

        let page_id = match self
            .file_manager
            .lock()
            .expect("disk manager lock poisoned")
            .allocate_page()
        {
            Ok(page_id) => page_id,
            Err(e) => {
                error!("could not allocate a new page: {}", e);
                Self::requeue_victim(&mut inner, frame_id, old_page_id);
                return None;
            }
        };

        if page.is_dirty() {
            debug!("evicting dirty page {} from frame {}", old_page_id, frame_id);
            let data = page.read_data();
            if let Err(e) = self.write_to_disk(old_page_id, &data) {
                error!("could not write back page {}: {}", old_page_id, e);
                drop(data);
                Self::requeue_victim(&mut inner, frame_id, old_page_id);
                return None;
            }
        }

        if old_page_id != INVALID_PAGE_ID {
            inner.page_table.remove(&old_page_id);
        }
        inner.page_table.insert(page_id, frame_id);

        page.write_data().fill(0);
        page.page_id.store(page_id, Ordering::Release);
        page.pin_count.store(1, Ordering::Release);
        page.is_dirty.store(false, Ordering::Release);
        debug!("allocated page {} into frame {}", page_id, frame_id);
        Some((page_id, page))
    }

    /// Drops a page from the cache and deallocates it on disk. Returns false
    /// when the page is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.lock_inner();
        if let Some(frame_id) = inner.page_table.find(&page_id) {
            let page = inner.frames[frame_id].clone();
            if page.pin_count() > 0 {
                return false;
            }
            inner.lru_replacer.drop_frame(frame_id);
            inner.page_table.remove(&page_id);
            page.reset();
            inner.free_list.push_back(frame_id);
        }
        self.file_manager
            .lock()
            .expect("disk manager lock poisoned")
            .deallocate_page(page_id);
        true
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("buffer pool latch poisoned")
    }

    fn write_to_disk(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> std::io::Result<()> {
        self.file_manager
            .lock()
            .expect("disk manager lock poisoned")
            .write_page(page_id, data)
    }

    /// Picks the frame to reuse: the free list first, otherwise the oldest
    /// evictable frame from the replacer.
    fn get_victim(inner: &mut PoolInner) -> Option<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            debug_assert_eq!(inner.frames[frame_id].page_id(), INVALID_PAGE_ID);
            return Some(frame_id);
        }
        let frame_id = inner.lru_replacer.pop_least_recently_used()?;
        debug_assert_eq!(inner.frames[frame_id].pin_count(), 0);
        Some(frame_id)
    }

    /// Puts a victim frame back where it came from after a failed operation.
    fn requeue_victim(inner: &mut PoolInner, frame_id: FrameId, old_page_id: PageId) {
        if old_page_id == INVALID_PAGE_ID {
            inner.free_list.push_front(frame_id);
        } else {
            inner.lru_replacer.add_frame(frame_id);
        }
    }
}
