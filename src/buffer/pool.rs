//! Buffer pool implementation.
//!
//! The buffer pool manages a fixed number of in-memory page frames,
//! caching pages read from the store and writing dirty pages back when
//! their frame is reused.

use crate::buffer::clock::ClockHand;
use crate::buffer::frame::Frame;
use crate::error::{Result, StorageError};
use crate::latch::{LatchMode, Latched};
use crate::storage::PageStore;
use crate::types::PageId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub resident: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

/// Page cache over a [`PageStore`]
pub trait BufferPool: Send + Sync {
    /// Pin `page_id` in a frame and latch that frame in `mode`.
    ///
    /// The page is read from the store at most once however many threads miss
    /// on it at the same time. The returned guard releases the latch and the
    /// pin when dropped.
    fn fetch(&self, page_id: PageId, mode: LatchMode) -> Result<FrameGuard<'_>>;

    /// Drop one pin on a resident page, marking it dirty if requested.
    ///
    /// Balances [`FrameGuard::unlatch`]; guards that are simply dropped unpin
    /// themselves.
    fn unpin(&self, page_id: PageId, is_dirty: bool) -> Result<()>;

    /// Write a resident page back if it is dirty
    fn flush(&self, page_id: PageId) -> Result<()>;

    /// Write back every dirty frame, then sync the store
    fn flush_all(&self) -> Result<()>;

    /// Whether `page_id` currently occupies a frame
    fn is_resident(&self, page_id: PageId) -> bool;

    /// Current pin count of a resident page
    fn pin_count(&self, page_id: PageId) -> Option<u32>;

    /// Number of frames
    fn capacity(&self) -> usize;

    fn stats(&self) -> PoolStats;
}

/// Clock-sweep buffer pool implementation
pub struct BufferPoolImpl {
    /// The store frames are loaded from and written back to
    store: Arc<dyn PageStore>,
    frames: Box<[Frame]>,
    /// Page to frame translation
    table: Latched<HashMap<PageId, usize>>,
    clock: ClockHand,
    counters: Counters,
}

impl BufferPoolImpl {
    /// Create a pool of `capacity` frames over `store`
    pub fn new(store: Arc<dyn PageStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let frames = (0..capacity).map(|_| Frame::new()).collect();
        debug!(capacity, "buffer pool created");
        Self {
            store,
            frames,
            table: Latched::new(HashMap::with_capacity(capacity)),
            clock: ClockHand::new(),
            counters: Counters::default(),
        }
    }

}

impl BufferPool for BufferPoolImpl {
    fn fetch(&self, page_id: PageId, mode: LatchMode) -> Result<FrameGuard<'_>> {
        if mode == LatchMode::None {
            return Err(StorageError::invalid_operation(
                "fetch needs a latch mode to access the frame",
            ));
        }
        if !page_id.is_valid() {
            return Err(StorageError::PageNotFound(page_id));
        }

        let idx = match self.pin_resident(page_id) {
            Some(idx) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                idx
            }
            None => self.load(page_id)?,
        };

        // The table latch is released before waiting on the frame latch
        self.frames[idx].latch.lock(mode);
        trace!(page = %page_id, frame = idx, ?mode, "fetched");
        Ok(FrameGuard {
            pool: self,
            idx,
            page_id,
            mode,
            dirty: false,
            _not_send: PhantomData,
        })
    }

    fn unpin(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let idx = {
            let table = self.table.shared();
            match table.get(&page_id) {
                Some(&idx) => idx,
                None => {
                    return Err(StorageError::invalid_operation(format!(
                        "unpin of page {page_id} which is not resident"
                    )))
                }
            }
        };
        let frame = &self.frames[idx];
        if is_dirty {
            frame.mark_dirty();
        }
        if !frame.unpin() {
            return Err(StorageError::invalid_operation(format!(
                "unpin of page {page_id} which is not pinned"
            )));
        }
        Ok(())
    }

    fn flush(&self, page_id: PageId) -> Result<()> {
        let idx = {
            let table = self.table.shared();
            match table.get(&page_id) {
                Some(&idx) => {
                    self.frames[idx].pin();
                    idx
                }
                None => return Ok(()),
            }
        };
        let result = self.flush_pinned(idx, page_id);
        self.frames[idx].unpin();
        result
    }

    /// Resident pages are pinned under the SX table latch so none of them can
    /// be evicted; the latch is released before waiting on any frame latch.
    fn flush_all(&self) -> Result<()> {
        let resident: Vec<(PageId, usize)> = {
            let table = self.table.sx();
            table
                .iter()
                .map(|(&page_id, &idx)| {
                    self.frames[idx].pin();
                    (page_id, idx)
                })
                .collect()
        };

        let mut result = Ok(());
        for &(page_id, idx) in &resident {
            if result.is_ok() {
                result = self.flush_pinned(idx, page_id);
            }
            self.frames[idx].unpin();
        }
        result?;

        self.store.sync()?;
        debug!(pages = resident.len(), "buffer pool flushed");
        Ok(())
    }

    fn is_resident(&self, page_id: PageId) -> bool {
        self.table.shared().contains_key(&page_id)
    }

    fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let table = self.table.shared();
        table.get(&page_id).map(|&idx| self.frames[idx].pin_count())
    }

    fn capacity(&self) -> usize {
        self.frames.len()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            resident: self.table.shared().len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            write_backs: self.counters.write_backs.load(Ordering::Relaxed),
        }
    }

}

impl BufferPoolImpl {
    /// Look the page up under the shared table latch and pin it
    fn pin_resident(&self, page_id: PageId) -> Option<usize> {
        let table = self.table.shared();
        let idx = *table.get(&page_id)?;
        let frame = &self.frames[idx];
        frame.pin();
        frame.touch();
        Some(idx)
    }

    /// Miss path: swap `page_id` into a victim frame, returning it pinned
    fn load(&self, page_id: PageId) -> Result<usize> {
        let mut table = self.table.exclusive();

        // Another thread may have loaded it while we waited
        if let Some(&idx) = table.get(&page_id) {
            let frame = &self.frames[idx];
            frame.pin();
            frame.touch();
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(idx);
        }

        let victim = match self.clock.find_victim(&self.frames) {
            Some(idx) => idx,
            None => {
                warn!(page = %page_id, capacity = self.capacity(), "every frame is pinned");
                return Err(StorageError::BufferPoolExhausted);
            }
        };
        let frame = &self.frames[victim];
        let old = frame.page_id();

        // An unpinned frame has no latch holders, and nobody can pin it while
        // the table latch is held exclusively.
        if old.is_valid() {
            if frame.is_dirty() {
                // SAFETY: unpinned victim, see above
                let data = unsafe { frame.data() };
                self.store.write_page(old, data)?;
                frame.take_dirty();
                self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
            }
            table.remove(&old);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(page = %old, frame = victim, "evicted");
        }

        // SAFETY: unpinned victim, see above
        let data = unsafe { frame.data_mut() };
        if let Err(e) = self.store.read_page(page_id, data) {
            frame.clear();
            return Err(e);
        }

        frame.install(page_id);
        table.insert(page_id, victim);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Ok(victim)
    }

    /// Write back a frame the caller has pinned, if it is dirty
    fn flush_pinned(&self, idx: usize, page_id: PageId) -> Result<()> {
        let frame = &self.frames[idx];
        frame.latch.lock(LatchMode::Shared);
        let result = if frame.take_dirty() {
            // SAFETY: shared latch held
            let data = unsafe { frame.data() };
            match self.store.write_page(page_id, data) {
                Ok(()) => {
                    self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => {
                    frame.mark_dirty();
                    Err(e)
                }
            }
        } else {
            Ok(())
        };
        frame.latch.unlock(LatchMode::Shared)?;
        result
    }

    /// Release the latch and pin held by a guard
    fn release(&self, idx: usize, mode: LatchMode, dirty: bool) {
        let frame = &self.frames[idx];
        // Dirty is published before the latch is released so a flusher that
        // acquires the latch afterwards sees it.
        if dirty {
            frame.mark_dirty();
        }
        if let Err(e) = frame.latch.unlock(mode) {
            error!(frame = idx, error = %e, "frame latch release failed");
        }
        frame.unpin();
    }
}

/// A pinned, latched frame.
///
/// Must be released on the thread that acquired it.
pub struct FrameGuard<'a> {
    pool: &'a BufferPoolImpl,
    idx: usize,
    page_id: PageId,
    mode: LatchMode,
    dirty: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> FrameGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the guard holds the frame latch in some mode
        unsafe { self.pool.frames[self.idx].data() }
    }

    /// Mutable page bytes; requires an exclusive hold and marks the frame dirty
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        if self.mode != LatchMode::Exclusive {
            return Err(StorageError::latch_protocol(format!(
                "page {} modified under a {:?} latch",
                self.page_id, self.mode
            )));
        }
        self.dirty = true;
        // SAFETY: the guard holds the frame latch exclusively
        Ok(unsafe { self.pool.frames[self.idx].data_mut() })
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Convert an SX hold into an exclusive one
    pub fn upgrade(&mut self) -> Result<()> {
        if self.mode != LatchMode::SharedExclusive {
            return Err(StorageError::latch_protocol("upgrade without an SX hold"));
        }
        self.pool.frames[self.idx].latch.upgrade_sx_to_exclusive()?;
        self.mode = LatchMode::Exclusive;
        Ok(())
    }

    /// Convert an exclusive hold into SX
    pub fn downgrade(&mut self) -> Result<()> {
        if self.mode != LatchMode::Exclusive {
            return Err(StorageError::latch_protocol(
                "downgrade without an exclusive hold",
            ));
        }
        self.pool.frames[self.idx].latch.downgrade_exclusive_to_sx()?;
        self.mode = LatchMode::SharedExclusive;
        Ok(())
    }

    /// Release the latch but keep the page pinned; balance with
    /// [`BufferPool::unpin`].
    pub fn unlatch(self) -> PageId {
        let this = ManuallyDrop::new(self);
        let frame = &this.pool.frames[this.idx];
        if this.dirty {
            frame.mark_dirty();
        }
        if let Err(e) = frame.latch.unlock(this.mode) {
            error!(frame = this.idx, error = %e, "frame latch release failed");
        }
        this.page_id
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.pool.release(self.idx, self.mode, self.dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageStoreImpl;
    use crate::test_util::small_anon;
    use crate::types::PAGE_SIZE;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    fn pool(pages: u32, capacity: usize) -> (Arc<PageStoreImpl>, BufferPoolImpl) {
        let store = Arc::new(PageStoreImpl::create(None, pages, small_anon()).unwrap());
        let pool = BufferPoolImpl::new(store.clone(), capacity);
        (store, pool)
    }

    fn stamp(pool: &dyn BufferPool, page: u32, byte: u8) {
        let mut guard = pool.fetch(PageId::new(page), LatchMode::Exclusive).unwrap();
        guard.data_mut().unwrap().fill(byte);
    }

    #[test]
    fn test_fetch_modify_and_read_back() -> Result<()> {
        let (_store, pool) = pool(4, 4);
        stamp(&pool, 1, 0x11);

        let guard = pool.fetch(PageId::new(1), LatchMode::Shared)?;
        assert!(guard.data().iter().all(|&b| b == 0x11));
        assert_eq!(pool.pin_count(PageId::new(1)), Some(1));
        drop(guard);
        assert_eq!(pool.pin_count(PageId::new(1)), Some(0));

        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        Ok(())
    }

    #[test]
    fn test_dirty_page_written_back_on_eviction() -> Result<()> {
        let (store, pool) = pool(4, 2);
        stamp(&pool, 0, 0xA0);
        stamp(&pool, 1, 0xA1);
        stamp(&pool, 2, 0xA2);

        assert!(!pool.is_resident(PageId::new(0)));
        let mut buf = vec![0u8; PAGE_SIZE];
        store.read_page(PageId::new(0), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0xA0));

        let guard = pool.fetch(PageId::new(0), LatchMode::Shared)?;
        assert_eq!(guard.data()[100], 0xA0);
        drop(guard);

        let stats = pool.stats();
        assert!(stats.evictions >= 2);
        assert!(stats.write_backs >= 2);
        Ok(())
    }

    #[test]
    fn test_referenced_frame_survives_sweep() -> Result<()> {
        let (_store, pool) = pool(8, 3);
        for page in 1..=3 {
            drop(pool.fetch(PageId::new(page), LatchMode::Shared)?);
        }
        // Sweep clears every reference bit and takes frame 0 (page 1)
        drop(pool.fetch(PageId::new(4), LatchMode::Shared)?);
        assert!(!pool.is_resident(PageId::new(1)));

        // Page 2 gets referenced again, so page 3 goes next
        drop(pool.fetch(PageId::new(2), LatchMode::Shared)?);
        drop(pool.fetch(PageId::new(5), LatchMode::Shared)?);
        assert!(pool.is_resident(PageId::new(2)));
        assert!(!pool.is_resident(PageId::new(3)));
        Ok(())
    }

    #[test]
    fn test_exhausted_when_everything_is_pinned() -> Result<()> {
        let (_store, pool) = pool(4, 2);
        let _a = pool.fetch(PageId::new(0), LatchMode::Shared)?;
        let _b = pool.fetch(PageId::new(1), LatchMode::Shared)?;
        assert!(matches!(
            pool.fetch(PageId::new(2), LatchMode::Shared),
            Err(StorageError::BufferPoolExhausted)
        ));
        Ok(())
    }

    #[test]
    fn test_concurrent_miss_loads_once() {
        let (store, pool) = pool(4, 4);
        let pool = Arc::new(pool);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let guard = pool.fetch(PageId::new(3), LatchMode::Shared).unwrap();
                    assert_eq!(guard.data().len(), PAGE_SIZE);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.io_stats().reads, 1);
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 7);
        assert_eq!(pool.pin_count(PageId::new(3)), Some(0));
    }

    #[test]
    fn test_data_mut_requires_exclusive() -> Result<()> {
        let (_store, pool) = pool(2, 2);
        let mut guard = pool.fetch(PageId::new(0), LatchMode::SharedExclusive)?;
        assert!(matches!(
            guard.data_mut(),
            Err(StorageError::LatchProtocol(_))
        ));
        guard.upgrade()?;
        guard.data_mut()?[0] = 7;
        guard.downgrade()?;
        assert_eq!(guard.mode(), LatchMode::SharedExclusive);
        assert_eq!(guard.data()[0], 7);
        Ok(())
    }

    #[test]
    fn test_fetch_rejects_bad_requests() {
        let (_store, pool) = pool(2, 2);
        assert!(pool.fetch(PageId::new(0), LatchMode::None).is_err());
        assert!(matches!(
            pool.fetch(PageId::INVALID, LatchMode::Shared),
            Err(StorageError::PageNotFound(_))
        ));
        assert!(matches!(
            pool.fetch(PageId::new(9), LatchMode::Shared),
            Err(StorageError::PageNotFound(_))
        ));
        // A failed load leaves nothing behind
        assert_eq!(pool.stats().resident, 0);
    }

    #[test]
    fn test_unlatch_keeps_pin() -> Result<()> {
        let (_store, pool) = pool(4, 1);
        let page = pool.fetch(PageId::new(1), LatchMode::Shared)?.unlatch();
        assert_eq!(pool.pin_count(page), Some(1));
        assert!(matches!(
            pool.fetch(PageId::new(2), LatchMode::Shared),
            Err(StorageError::BufferPoolExhausted)
        ));

        pool.unpin(page, false)?;
        assert!(pool.unpin(page, false).is_err());
        drop(pool.fetch(PageId::new(2), LatchMode::Shared)?);
        Ok(())
    }

    #[test]
    fn test_flush_all_persists_to_file() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.db");
        {
            let store = Arc::new(PageStoreImpl::create(Some(&path), 4, Default::default())?);
            let pool = BufferPoolImpl::new(store, 4);
            stamp(&pool, 2, 0x5C);
            pool.flush(PageId::new(2))?;
            stamp(&pool, 3, 0x3C);
            pool.flush_all()?;
            assert_eq!(pool.stats().write_backs, 2);
        }

        let store = PageStoreImpl::open(&path, Default::default())?;
        let mut buf = vec![0u8; PAGE_SIZE];
        store.read_page(PageId::new(2), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0x5C));
        store.read_page(PageId::new(3), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0x3C));
        Ok(())
    }
}
