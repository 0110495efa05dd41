//! Bitmap page allocator.
//!
//! The store is divided into groups of `GROUP_SIZE` pages, each tracked by
//! two bitmap pages at its start. Page 0 holds the superblock, pages
//! `GDT_START..GDT_START + GDT_PAGES` the group-descriptor table and
//! `CATALOG_PAGE` the catalog root; groups begin at `HEAD_OFFSET`.
//!
//! Latching: allocation and free run under the allocator latch in shared
//! mode and serialize per group on the bitmap frame latches. Growth takes SX,
//! re-checks, then upgrades to exclusive. Nothing here holds the shared latch
//! while waiting for SX.

mod group;
mod superblock;

pub use group::{GroupDescriptor, USABLE_PAGES_PER_GROUP};
pub use superblock::{Superblock, MAGIC, VERSION};

use crate::buffer::BufferPool;
use crate::error::{Result, StorageError};
use crate::latch::{LatchMode, Latched};
use crate::page::{checksum, PageBuf};
use crate::storage::PageStore;
use crate::types::{
    PageId, BITMAP_PAGES_PER_GROUP, DESCRIPTORS_PER_PAGE, GDT_PAGES, GDT_START, HEAD_OFFSET,
    MAX_GROUPS,
};
use group::{
    descriptor_page, first_zero, fresh_bitmap_head, locate, read_word, word_offset, write_word,
    WORDS_PER_BITMAP_PAGE, WORDS_PER_GROUP,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AllocStats {
    pub total_pages: u32,
    pub total_groups: u32,
    pub free_pages: u64,
    pub grows: u64,
}

/// Page allocator over a page store
pub struct PageAllocator {
    store: Arc<dyn PageStore>,
    pool: Arc<dyn BufferPool>,
    groups: Latched<Vec<GroupDescriptor>>,
    /// Group of the last successful allocation
    last_group: AtomicU32,
    grows: AtomicU64,
}

impl PageAllocator {
    /// Lay out the first group on a fresh store and persist the metadata
    pub fn create(store: Arc<dyn PageStore>, pool: Arc<dyn BufferPool>) -> Result<Self> {
        let needed = Superblock::pages_for_groups(1);
        let have = store.page_count();
        if have < needed {
            store.grow(needed - have)?;
        }

        let first = GroupDescriptor::fresh(0);
        write_fresh_bitmaps(store.as_ref(), &first)?;

        let allocator = Self::with_groups(store, pool, vec![first]);
        allocator.persist()?;
        info!(total_pages = needed, "page allocator initialized");
        Ok(allocator)
    }

    /// Read back and verify the superblock and descriptor table.
    ///
    /// Any mismatch is fatal; nothing is repaired.
    pub fn open(store: Arc<dyn PageStore>, pool: Arc<dyn BufferPool>) -> Result<Self> {
        let mut page = PageBuf::new();
        store
            .read_page(PageId::SUPERBLOCK, &mut page)
            .map_err(|e| match e {
                StorageError::PageNotFound(_) => StorageError::invalid_db("store has no superblock"),
                e => e,
            })?;
        let superblock = Superblock::read(&page)?;

        if store.page_count() < superblock.total_pages {
            return Err(StorageError::invalid_db(format!(
                "store holds {} pages but the superblock describes {}",
                store.page_count(),
                superblock.total_pages
            )));
        }

        let mut groups = Vec::with_capacity(superblock.total_groups as usize);
        for gdt_page in 0..GDT_PAGES {
            store.read_page(PageId::new(GDT_START.value() + gdt_page), &mut page)?;
            if checksum(&[page.as_bytes()]) != superblock.gdt_checksums[gdt_page as usize] {
                warn!(gdt_page, "group descriptor page checksum mismatch");
                return Err(StorageError::corruption(format!(
                    "group descriptor page {gdt_page} checksum mismatch"
                )));
            }

            let first = gdt_page * DESCRIPTORS_PER_PAGE;
            let last = (first + DESCRIPTORS_PER_PAGE).min(superblock.total_groups);
            for index in first..last {
                let desc = GroupDescriptor::read(&page, index).ok_or_else(|| {
                    StorageError::corruption(format!("group descriptor {index} is inconsistent"))
                })?;
                groups.push(desc);
            }
        }

        info!(
            total_pages = superblock.total_pages,
            total_groups = superblock.total_groups,
            "page allocator opened"
        );
        Ok(Self::with_groups(store, pool, groups))
    }

    fn with_groups(
        store: Arc<dyn PageStore>,
        pool: Arc<dyn BufferPool>,
        groups: Vec<GroupDescriptor>,
    ) -> Self {
        Self {
            store,
            pool,
            groups: Latched::new(groups),
            last_group: AtomicU32::new(0),
            grows: AtomicU64::new(0),
        }
    }

    /// Allocate a page, preferring the group of `hint`.
    ///
    /// Grows the store by one group when every group is full. Fails with
    /// `OutOfSpace` when the store cannot grow.
    pub fn alloc(&self, hint: Option<PageId>) -> Result<PageId> {
        for _ in 0..=MAX_GROUPS {
            {
                let groups = self.groups.shared();
                if let Some(page) = self.alloc_from_ring(&groups, hint)? {
                    return Ok(page);
                }
            }
            self.grow()?;
        }
        Err(StorageError::OutOfSpace)
    }

    /// Return a page to its group.
    ///
    /// Pages outside the allocator's range, metadata pages, bitmap pages and
    /// pages that are already free are ignored.
    pub fn free(&self, page: PageId) -> Result<()> {
        let groups = self.groups.shared();
        let Some((index, bit)) = locate(page).filter(|&(g, _)| (g as usize) < groups.len()) else {
            trace!(page = %page, "ignoring free outside the allocator range");
            return Ok(());
        };
        if bit < BITMAP_PAGES_PER_GROUP {
            return Ok(());
        }

        let desc = &groups[index as usize];
        let word_idx = bit / 64;
        let mask = 1u64 << (bit % 64);
        let mut frame = self.pool.fetch(desc.bitmap_page(word_idx), LatchMode::Exclusive)?;
        let off = word_offset(word_idx);
        let word = read_word(frame.data(), off);
        if word & mask == 0 {
            trace!(page = %page, "ignoring free of a page that is not allocated");
            return Ok(());
        }
        write_word(frame.data_mut()?, off, word & !mask);
        desc.release();
        desc.set_last_set(word_idx);
        trace!(page = %page, "freed");
        Ok(())
    }

    /// Whether `page` is in use. Metadata pages always are.
    pub fn is_allocated(&self, page: PageId) -> Result<bool> {
        if page.value() < HEAD_OFFSET {
            return Ok(true);
        }
        let groups = self.groups.shared();
        let Some((index, bit)) = locate(page).filter(|&(g, _)| (g as usize) < groups.len()) else {
            return Ok(false);
        };
        let desc = &groups[index as usize];
        let word_idx = bit / 64;
        let frame = self.pool.fetch(desc.bitmap_page(word_idx), LatchMode::Shared)?;
        let word = read_word(frame.data(), word_offset(word_idx));
        Ok(word & (1u64 << (bit % 64)) != 0)
    }

    /// Write the descriptor table and superblock with fresh checksums
    pub fn persist(&self) -> Result<()> {
        let groups = self.groups.sx();
        self.persist_groups(&groups)
    }

    pub fn total_groups(&self) -> u32 {
        self.groups.shared().len() as u32
    }

    pub fn total_pages(&self) -> u32 {
        Superblock::pages_for_groups(self.total_groups())
    }

    /// Sum of the group free counters
    pub fn free_pages(&self) -> u64 {
        self.groups
            .shared()
            .iter()
            .map(|g| g.free_pages() as u64)
            .sum()
    }

    pub fn stats(&self) -> AllocStats {
        let groups = self.groups.shared();
        let total_groups = groups.len() as u32;
        AllocStats {
            total_pages: Superblock::pages_for_groups(total_groups),
            total_groups,
            free_pages: groups.iter().map(|g| g.free_pages() as u64).sum(),
            grows: self.grows.load(Ordering::Relaxed),
        }
    }

    fn alloc_from_ring(
        &self,
        groups: &[GroupDescriptor],
        hint: Option<PageId>,
    ) -> Result<Option<PageId>> {
        let count = groups.len() as u32;
        let start = hint
            .and_then(locate)
            .map(|(g, _)| g)
            .filter(|&g| g < count)
            .unwrap_or_else(|| self.last_group.load(Ordering::Acquire) % count);

        for step in 0..count {
            let index = (start + step) % count;
            let desc = &groups[index as usize];
            if !desc.try_reserve() {
                continue;
            }
            match self.claim_bit(desc) {
                Ok(Some(bit)) => {
                    self.last_group.store(index, Ordering::Release);
                    let page = PageId::new(desc.start().value() + bit);
                    trace!(page = %page, group = index, "allocated");
                    return Ok(Some(page));
                }
                Ok(None) => {
                    desc.release();
                    warn!(group = index, "free counter is set but the bitmap is full");
                    return Err(StorageError::corruption(format!(
                        "group {index} free count disagrees with its bitmap"
                    )));
                }
                Err(e) => {
                    desc.release();
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Set the first clear bit at or after the group's last-set word
    fn claim_bit(&self, desc: &GroupDescriptor) -> Result<Option<u32>> {
        let mut frames = [
            self.pool.fetch(desc.bitmap_page(0), LatchMode::Exclusive)?,
            self.pool
                .fetch(desc.bitmap_page(WORDS_PER_BITMAP_PAGE), LatchMode::Exclusive)?,
        ];

        let hint = desc.last_set();
        for step in 0..WORDS_PER_GROUP {
            let word_idx = (hint + step) % WORDS_PER_GROUP;
            let frame = &mut frames[(word_idx / WORDS_PER_BITMAP_PAGE) as usize];
            let off = word_offset(word_idx);
            let word = read_word(frame.data(), off);
            if let Some(bit) = first_zero(word) {
                write_word(frame.data_mut()?, off, word | (1u64 << bit));
                desc.set_last_set(word_idx);
                return Ok(Some(word_idx * 64 + bit));
            }
        }
        Ok(None)
    }

    /// Add one group, unless another thread already made space
    fn grow(&self) -> Result<()> {
        let groups = self.groups.sx();
        if groups.iter().any(|g| g.free_pages() > 0) {
            return Ok(());
        }

        let index = groups.len() as u32;
        if index >= MAX_GROUPS {
            warn!(groups = index, "allocator is at its group limit");
            return Err(StorageError::OutOfSpace);
        }

        let mut groups = groups.upgrade()?;
        let needed = Superblock::pages_for_groups(index + 1);
        let have = self.store.page_count();
        if have < needed {
            if let Err(e) = self.store.grow(needed - have) {
                warn!(error = %e, "store growth failed");
                return Err(e);
            }
        }

        let desc = GroupDescriptor::fresh(index);
        write_fresh_bitmaps(self.store.as_ref(), &desc)?;
        groups.push(desc);
        if let Err(e) = self.persist_groups(&groups) {
            groups.pop();
            return Err(e);
        }

        self.last_group.store(index, Ordering::Release);
        self.grows.fetch_add(1, Ordering::Relaxed);
        debug!(group = index, total_pages = needed, "allocator grew");
        Ok(())
    }

    fn persist_groups(&self, groups: &[GroupDescriptor]) -> Result<()> {
        let empty = PageBuf::new();
        let empty_crc = checksum(&[empty.as_bytes()]);
        let mut gdt_checksums = vec![empty_crc; GDT_PAGES as usize];
        let used_pages = match groups.len() {
            0 => 0,
            n => descriptor_page(n as u32 - 1) + 1,
        };

        let mut page = PageBuf::new();
        for gdt_page in 0..used_pages {
            page.fill(0);
            let first = (gdt_page * DESCRIPTORS_PER_PAGE) as usize;
            for (index, desc) in groups
                .iter()
                .enumerate()
                .skip(first)
                .take(DESCRIPTORS_PER_PAGE as usize)
            {
                desc.write(&mut page, index as u32);
            }
            self.store
                .write_page(PageId::new(GDT_START.value() + gdt_page), &page)?;
            gdt_checksums[gdt_page as usize] = checksum(&[page.as_bytes()]);
        }

        let total_groups = groups.len() as u32;
        let superblock = Superblock {
            total_pages: Superblock::pages_for_groups(total_groups),
            total_groups,
            gdt_checksums,
        };
        superblock.write(&mut page);
        self.store.write_page(PageId::SUPERBLOCK, &page)?;
        trace!(total_groups, "allocator metadata persisted");
        Ok(())
    }
}

/// Bitmap pages of a new group go straight to the store: the pages did not
/// exist before, so no frame can hold them.
fn write_fresh_bitmaps(store: &dyn PageStore, desc: &GroupDescriptor) -> Result<()> {
    let mut page = PageBuf::new();
    fresh_bitmap_head(&mut page);
    store.write_page(desc.start(), &page)?;
    page.fill(0);
    for extra in 1..BITMAP_PAGES_PER_GROUP {
        store.write_page(PageId::new(desc.start().value() + extra), &page)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolImpl;
    use crate::storage::{PageStoreImpl, StoreOptions};
    use crate::test_util::small_anon;
    use crate::types::{CATALOG_PAGE, GROUP_SIZE, PAGE_SIZE};
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    fn allocator() -> (Arc<PageStoreImpl>, Arc<BufferPoolImpl>, PageAllocator) {
        let store = Arc::new(PageStoreImpl::create(None, 0, small_anon()).unwrap());
        let pool = Arc::new(BufferPoolImpl::new(store.clone(), 64));
        let alloc = PageAllocator::create(store.clone(), pool.clone()).unwrap();
        (store, pool, alloc)
    }

    #[test]
    fn test_create_lays_out_first_group() -> Result<()> {
        let (store, _pool, alloc) = allocator();
        assert_eq!(store.page_count(), HEAD_OFFSET + GROUP_SIZE);
        assert_eq!(alloc.total_groups(), 1);
        assert_eq!(alloc.free_pages(), USABLE_PAGES_PER_GROUP as u64);
        assert!(alloc.is_allocated(PageId::new(HEAD_OFFSET))?);
        assert!(alloc.is_allocated(PageId::new(HEAD_OFFSET + 1))?);
        assert!(!alloc.is_allocated(PageId::new(HEAD_OFFSET + 2))?);
        Ok(())
    }

    #[test]
    fn test_alloc_and_free() -> Result<()> {
        let (_store, _pool, alloc) = allocator();
        let a = alloc.alloc(None)?;
        let b = alloc.alloc(None)?;
        assert_eq!(a, PageId::new(HEAD_OFFSET + 2));
        assert_eq!(b, PageId::new(HEAD_OFFSET + 3));
        assert_eq!(alloc.free_pages(), USABLE_PAGES_PER_GROUP as u64 - 2);

        alloc.free(a)?;
        assert!(!alloc.is_allocated(a)?);
        assert_eq!(alloc.free_pages(), USABLE_PAGES_PER_GROUP as u64 - 1);

        // Freed slot is found again from the last-set hint
        assert_eq!(alloc.alloc(None)?, a);
        Ok(())
    }

    #[test]
    fn test_free_ignores_foreign_pages() -> Result<()> {
        let (_store, _pool, alloc) = allocator();
        let before = alloc.free_pages();
        alloc.free(PageId::SUPERBLOCK)?;
        alloc.free(CATALOG_PAGE)?;
        alloc.free(PageId::new(HEAD_OFFSET))?;
        alloc.free(PageId::new(HEAD_OFFSET + GROUP_SIZE * 5))?;
        alloc.free(PageId::INVALID)?;
        // Never allocated
        alloc.free(PageId::new(HEAD_OFFSET + 100))?;
        assert_eq!(alloc.free_pages(), before);

        let page = alloc.alloc(None)?;
        alloc.free(page)?;
        alloc.free(page)?;
        assert_eq!(alloc.free_pages(), before);
        Ok(())
    }

    #[test]
    fn test_exhausting_a_group_grows_once() -> Result<()> {
        let (store, _pool, alloc) = allocator();
        let mut seen = HashSet::new();
        for _ in 0..USABLE_PAGES_PER_GROUP {
            let page = alloc.alloc(None)?;
            assert!(seen.insert(page));
        }
        assert_eq!(alloc.free_pages(), 0);
        assert_eq!(alloc.stats().grows, 0);

        let next = alloc.alloc(None)?;
        assert_eq!(next, PageId::new(HEAD_OFFSET + GROUP_SIZE + 2));

        let stats = alloc.stats();
        assert_eq!(stats.grows, 1);
        assert_eq!(stats.total_groups, 2);
        assert_eq!(stats.total_pages, HEAD_OFFSET + 2 * GROUP_SIZE);
        assert_eq!(store.page_count(), stats.total_pages);
        assert_eq!(stats.free_pages, USABLE_PAGES_PER_GROUP as u64 - 1);
        Ok(())
    }

    #[test]
    fn test_hint_selects_group() -> Result<()> {
        let (_store, _pool, alloc) = allocator();
        while alloc.free_pages() > 0 {
            alloc.alloc(None)?;
        }
        let in_second = alloc.alloc(None)?;
        alloc.free(PageId::new(HEAD_OFFSET + 10))?;

        // Affinity favours the second group unless the hint says otherwise
        assert_eq!(locate(alloc.alloc(None)?).map(|(g, _)| g), Some(1));
        assert_eq!(
            alloc.alloc(Some(PageId::new(HEAD_OFFSET + 50)))?,
            PageId::new(HEAD_OFFSET + 10)
        );
        assert_eq!(locate(in_second).map(|(g, _)| g), Some(1));
        Ok(())
    }

    #[test]
    fn test_grow_fails_when_store_cannot_grow() -> Result<()> {
        // Room for one group only
        let options = StoreOptions {
            sync_on_write: false,
            anon_reserve_bytes: (HEAD_OFFSET + GROUP_SIZE + 16) as u64 * PAGE_SIZE as u64,
        };
        let store = Arc::new(PageStoreImpl::create(None, 0, options)?);
        let pool = Arc::new(BufferPoolImpl::new(store.clone(), 16));
        let alloc = PageAllocator::create(store, pool)?;

        for _ in 0..USABLE_PAGES_PER_GROUP {
            alloc.alloc(None)?;
        }
        assert!(matches!(alloc.alloc(None), Err(StorageError::OutOfSpace)));
        assert_eq!(alloc.total_groups(), 1);
        Ok(())
    }

    #[test]
    fn test_concurrent_alloc_is_unique() {
        let (_store, _pool, alloc) = allocator();
        let alloc = Arc::new(alloc);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    (0..500)
                        .map(|_| alloc.alloc(None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for page in handle.join().unwrap() {
                assert!(all.insert(page));
            }
        }
        assert_eq!(all.len(), 2000);
        assert_eq!(alloc.free_pages(), USABLE_PAGES_PER_GROUP as u64 - 2000);
    }

    #[test]
    fn test_racing_allocators_grow_once() -> Result<()> {
        let (_store, _pool, alloc) = allocator();
        let prefilled = USABLE_PAGES_PER_GROUP - 100;
        let mut all = HashSet::new();
        for _ in 0..prefilled {
            all.insert(alloc.alloc(None)?);
        }

        let alloc = Arc::new(alloc);
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..100)
                        .map(|_| alloc.alloc(None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            for page in handle.join().unwrap() {
                assert!(all.insert(page));
            }
        }

        let stats = alloc.stats();
        assert_eq!(stats.grows, 1);
        assert_eq!(stats.total_groups, 2);
        assert_eq!(
            stats.free_pages,
            2 * USABLE_PAGES_PER_GROUP as u64 - all.len() as u64
        );
        Ok(())
    }

    #[test]
    fn test_reopen_restores_state() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alloc.db");
        let allocated = {
            let store = Arc::new(PageStoreImpl::create(Some(&path), 0, Default::default())?);
            let pool = Arc::new(BufferPoolImpl::new(store.clone(), 16));
            let alloc = PageAllocator::create(store.clone(), pool.clone())?;
            let pages: Vec<_> = (0..10).map(|_| alloc.alloc(None)).collect::<Result<_>>()?;
            pool.flush_all()?;
            alloc.persist()?;
            pages
        };

        let store = Arc::new(PageStoreImpl::open(&path, Default::default())?);
        let pool = Arc::new(BufferPoolImpl::new(store.clone(), 16));
        let alloc = PageAllocator::open(store, pool)?;
        assert_eq!(alloc.free_pages(), USABLE_PAGES_PER_GROUP as u64 - 10);
        for page in allocated {
            assert!(alloc.is_allocated(page)?);
        }
        assert_eq!(alloc.alloc(None)?, PageId::new(HEAD_OFFSET + 12));
        Ok(())
    }

    #[test]
    fn test_open_detects_descriptor_corruption() -> Result<()> {
        let (store, pool, alloc) = allocator();
        alloc.alloc(None)?;
        alloc.persist()?;
        drop(alloc);

        let mut page = vec![0u8; PAGE_SIZE];
        store.read_page(GDT_START, &mut page)?;
        page[5] ^= 0x01;
        store.write_page(GDT_START, &page)?;

        assert!(matches!(
            PageAllocator::open(store, pool),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_open_rejects_short_store() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.db");
        {
            let store = Arc::new(PageStoreImpl::create(Some(&path), 0, Default::default())?);
            let pool = Arc::new(BufferPoolImpl::new(store.clone(), 8));
            PageAllocator::create(store, pool)?;
        }
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(((HEAD_OFFSET + 10) as usize * PAGE_SIZE) as u64)?;
        drop(file);

        let store = Arc::new(PageStoreImpl::open(&path, Default::default())?);
        let pool = Arc::new(BufferPoolImpl::new(store.clone(), 8));
        assert!(matches!(
            PageAllocator::open(store, pool),
            Err(StorageError::InvalidDatabaseFile(_))
        ));
        Ok(())
    }

    #[test]
    fn test_open_rejects_empty_store() -> Result<()> {
        let store = Arc::new(PageStoreImpl::create(None, 0, small_anon())?);
        let pool = Arc::new(BufferPoolImpl::new(store.clone(), 8));
        assert!(matches!(
            PageAllocator::open(store, pool),
            Err(StorageError::InvalidDatabaseFile(_))
        ));
        Ok(())
    }
}
