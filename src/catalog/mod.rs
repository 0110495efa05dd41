//! Catalog: a record store over slotted pages.
//!
//! Payloads up to `NORMAL_DATA_LIMIT` bytes live as cells in slotted data
//! pages found through a free-space map; larger payloads are split across a
//! chain of pages. Keys and values use separate FSM chains so that they never
//! share data pages.
//!
//! Latch order is FSM index page, then data page, then allocator bitmap
//! pages. `free` releases the data page before it takes the FSM page.

mod fsm;
mod root;
mod vptr;

pub use fsm::{estimate, units_needed, FsmEntry, FsmPage, FSM_ENTRIES_PER_PAGE, FSM_UNIT};
pub use root::CatalogRoot;
pub use vptr::{VPtr, VPTR_SIZE};

use crate::alloc::PageAllocator;
use crate::buffer::{BufferPool, FrameGuard};
use crate::error::{Result, StorageError};
use crate::latch::LatchMode;
use crate::page::{ChainPage, SlotHeap, CHAIN_CAPACITY};
use crate::types::{PageId, CATALOG_PAGE};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Largest payload stored inside a slotted page
pub const NORMAL_DATA_LIMIT: usize = 2048;

/// Per-chain space accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChainStats {
    pub fsm_pages: u32,
    pub data_pages: u32,
    /// Sum of the FSM estimates, in bytes
    pub estimated_free_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CatalogStats {
    pub values: ChainStats,
    pub keys: ChainStats,
}

/// Record store
pub struct Catalog {
    pool: Arc<dyn BufferPool>,
    alloc: Arc<PageAllocator>,
    value_fsm: PageId,
    key_fsm: PageId,
}

impl Catalog {
    /// Write a fresh root with empty key and value FSM chains
    pub fn create(pool: Arc<dyn BufferPool>, alloc: Arc<PageAllocator>) -> Result<Self> {
        let value_fsm = alloc.alloc(None)?;
        let key_fsm = alloc.alloc(Some(value_fsm))?;
        for head in [value_fsm, key_fsm] {
            let mut frame = pool.fetch(head, LatchMode::Exclusive)?;
            FsmPage::init(frame.data_mut()?);
        }

        let root = CatalogRoot {
            value_fsm,
            key_fsm,
            schema_root: PageId::INVALID,
        };
        {
            let mut frame = pool.fetch(CATALOG_PAGE, LatchMode::Exclusive)?;
            root.write(frame.data_mut()?);
        }

        info!(%value_fsm, %key_fsm, "catalog created");
        Ok(Self {
            pool,
            alloc,
            value_fsm,
            key_fsm,
        })
    }

    /// Load the root written by [`Catalog::create`]
    pub fn open(pool: Arc<dyn BufferPool>, alloc: Arc<PageAllocator>) -> Result<Self> {
        let root = {
            let frame = pool.fetch(CATALOG_PAGE, LatchMode::Shared)?;
            CatalogRoot::read(frame.data())?
        };
        debug!(value_fsm = %root.value_fsm, key_fsm = %root.key_fsm, "catalog opened");
        Ok(Self {
            pool,
            alloc,
            value_fsm: root.value_fsm,
            key_fsm: root.key_fsm,
        })
    }

    /// Store `data`, returning where it went
    pub fn write(&self, data: &[u8], is_key: bool) -> Result<VPtr> {
        if data.len() > NORMAL_DATA_LIMIT {
            return self.write_chain(data);
        }
        let head = if is_key { self.key_fsm } else { self.value_fsm };
        self.write_normal(head, data)
    }

    /// Copy out the payload `vptr` refers to
    pub fn read(&self, vptr: &VPtr) -> Result<Vec<u8>> {
        if !vptr.is_valid() {
            return Err(StorageError::invalid_operation("read through an invalid VPtr"));
        }
        match *vptr {
            VPtr::Normal { page, slot, len } => {
                let frame = self.pool.fetch(page, LatchMode::Shared)?;
                let heap = SlotHeap::open(frame.data())?;
                let cell = heap.get(slot)?;
                if cell.len() != len as usize {
                    return Err(StorageError::invalid_operation(format!(
                        "{vptr} does not match the stored cell of {} bytes",
                        cell.len()
                    )));
                }
                Ok(cell.to_vec())
            }
            VPtr::Huge { head, len } => self.read_chain(head, len as usize),
        }
    }

    /// Release the payload `vptr` refers to
    pub fn free(&self, vptr: &VPtr) -> Result<()> {
        if !vptr.is_valid() {
            return Err(StorageError::invalid_operation("free through an invalid VPtr"));
        }
        match *vptr {
            VPtr::Normal { page, slot, len } => self.free_normal(page, slot, len),
            VPtr::Huge { head, len } => self.free_chain(head, len as usize),
        }
    }

    /// Root of the schema tree, `INVALID` until one is set
    pub fn schema_root(&self) -> Result<PageId> {
        let frame = self.pool.fetch(CATALOG_PAGE, LatchMode::Shared)?;
        Ok(CatalogRoot::read(frame.data())?.schema_root)
    }

    pub fn set_schema_root(&self, page: PageId) -> Result<()> {
        let mut frame = self.pool.fetch(CATALOG_PAGE, LatchMode::Exclusive)?;
        let mut root = CatalogRoot::read(frame.data())?;
        root.schema_root = page;
        root.write(frame.data_mut()?);
        Ok(())
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        Ok(CatalogStats {
            values: self.chain_stats(self.value_fsm)?,
            keys: self.chain_stats(self.key_fsm)?,
        })
    }

    /// Walk the FSM chain at `head` for a page with room, adding data pages
    /// and index pages as needed.
    fn write_normal(&self, head: PageId, data: &[u8]) -> Result<VPtr> {
        let units = units_needed(data.len());
        let mut fsm_frame = self.pool.fetch(head, LatchMode::Exclusive)?;

        loop {
            let mut from = 0;
            loop {
                let candidate = FsmPage::open(fsm_frame.data())?.find(from, units);
                let Some((index, entry)) = candidate else {
                    break;
                };
                let (slot, left) = self.insert_into(entry.page, data)?;
                FsmPage::open(fsm_frame.data_mut()?)?.set_estimate(index, left);
                if let Some(slot) = slot {
                    return Ok(normal_vptr(entry.page, slot, data));
                }
                // The estimate was stale; it has been corrected, keep looking
                trace!(page = %entry.page, "FSM candidate too tight");
                from = index + 1;
            }

            if !FsmPage::open(fsm_frame.data())?.is_full() {
                return self.write_new_page(&mut fsm_frame, data);
            }

            let next = FsmPage::open(fsm_frame.data())?.next();
            let next = if next.is_valid() {
                next
            } else {
                self.extend_chain(&mut fsm_frame)?
            };
            // Hand over hand: the next index page is latched before this one
            // is released
            fsm_frame = self.pool.fetch(next, LatchMode::Exclusive)?;
        }
    }

    /// Try to store `data` in an existing data page; returns the slot (if it
    /// fit) and the page's new estimate
    fn insert_into(&self, page: PageId, data: &[u8]) -> Result<(Option<u16>, u8)> {
        let mut frame = self.pool.fetch(page, LatchMode::Exclusive)?;
        let mut heap = SlotHeap::open(frame.data_mut()?)?;
        let slot = heap.insert(data);
        Ok((slot, estimate(heap.reclaimable())))
    }

    /// Start a new data page recorded in the latched FSM page
    fn write_new_page(&self, fsm_frame: &mut FrameGuard<'_>, data: &[u8]) -> Result<VPtr> {
        let fsm_page = fsm_frame.page_id();
        let index = FsmPage::open(fsm_frame.data())?.len() as u16;
        let page = self.alloc.alloc(Some(fsm_page))?;

        let (slot, left) = {
            let mut frame = self.pool.fetch(page, LatchMode::Exclusive)?;
            let mut heap = SlotHeap::init(frame.data_mut()?, fsm_page, index);
            let slot = heap.insert(data).ok_or_else(|| {
                StorageError::invalid_operation("record does not fit an empty data page")
            })?;
            (slot, estimate(heap.reclaimable()))
        };

        FsmPage::open(fsm_frame.data_mut()?)?
            .push(left, page)
            .ok_or_else(|| StorageError::corruption("free-space-map page filled up under latch"))?;
        debug!(%page, %fsm_page, entry = index, "new data page");
        Ok(normal_vptr(page, slot, data))
    }

    /// Append an empty index page after the latched, full tail page
    fn extend_chain(&self, fsm_frame: &mut FrameGuard<'_>) -> Result<PageId> {
        let next = self.alloc.alloc(Some(fsm_frame.page_id()))?;
        {
            let mut frame = self.pool.fetch(next, LatchMode::Exclusive)?;
            FsmPage::init(frame.data_mut()?);
        }
        FsmPage::open(fsm_frame.data_mut()?)?.set_next(next);
        debug!(page = %next, prev = %fsm_frame.page_id(), "FSM chain extended");
        Ok(next)
    }

    fn free_normal(&self, page: PageId, slot: u16, len: u16) -> Result<()> {
        let (fsm_page, fsm_entry) = {
            let mut frame = self.pool.fetch(page, LatchMode::Exclusive)?;
            let mut heap = SlotHeap::open(frame.data_mut()?)?;
            let stored = heap.get(slot)?.len();
            if stored != len as usize {
                return Err(StorageError::invalid_operation(format!(
                    "free of {page}:{slot} with length {len}, cell holds {stored}"
                )));
            }
            heap.free(slot)?;
            heap.fsm_owner()
        };

        let mut fsm_frame = self.pool.fetch(fsm_page, LatchMode::Exclusive)?;
        let mut fsm = FsmPage::open(fsm_frame.data_mut()?)?;
        let entry = fsm_entry as usize;
        if entry >= fsm.len() || fsm.entry(entry).page != page {
            warn!(%page, %fsm_page, entry, "data page back-pointer does not match its FSM entry");
            return Err(StorageError::corruption(format!(
                "page {page} is not described by entry {entry} of FSM page {fsm_page}"
            )));
        }

        let left = {
            let frame = self.pool.fetch(page, LatchMode::Shared)?;
            estimate(SlotHeap::open(frame.data())?.reclaimable())
        };
        fsm.set_estimate(entry, left);
        Ok(())
    }

    /// Allocate every chain page up front so a failure leaves nothing behind
    fn write_chain(&self, data: &[u8]) -> Result<VPtr> {
        let len = u32::try_from(data.len()).map_err(|_| StorageError::PayloadTooLarge {
            size: data.len(),
            max: u32::MAX as usize,
        })?;

        let count = data.len().div_ceil(CHAIN_CAPACITY);
        let mut pages: Vec<PageId> = Vec::with_capacity(count);
        let result = self.fill_chain(data, count, &mut pages);
        if let Err(e) = result {
            warn!(error = %e, pages = pages.len(), "chain write failed, releasing pages");
            for &page in &pages {
                if let Err(free_err) = self.alloc.free(page) {
                    warn!(%page, error = %free_err, "failed to release chain page");
                }
            }
            return Err(e);
        }

        debug!(head = %pages[0], pages = count, len, "chain written");
        Ok(VPtr::Huge {
            head: pages[0],
            len,
        })
    }

    fn fill_chain(&self, data: &[u8], count: usize, pages: &mut Vec<PageId>) -> Result<()> {
        for _ in 0..count {
            let page = self.alloc.alloc(pages.last().copied())?;
            pages.push(page);
        }
        for (i, chunk) in data.chunks(CHAIN_CAPACITY).enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(PageId::INVALID);
            let mut frame = self.pool.fetch(pages[i], LatchMode::Exclusive)?;
            ChainPage::write(frame.data_mut()?, next, chunk);
        }
        Ok(())
    }

    fn read_chain(&self, head: PageId, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut page = head;
        while out.len() < len {
            if !page.is_valid() {
                return Err(StorageError::corruption(format!(
                    "chain at {head} ends after {} of {len} bytes",
                    out.len()
                )));
            }
            let frame = self.pool.fetch(page, LatchMode::Shared)?;
            let (next, chunk) = ChainPage::read(frame.data())?;
            let want = (len - out.len()).min(CHAIN_CAPACITY);
            if chunk.len() != want {
                return Err(StorageError::invalid_operation(format!(
                    "chain page {page} holds {} bytes, a {len} byte payload needs {want}",
                    chunk.len()
                )));
            }
            out.extend_from_slice(chunk);
            page = next;
        }
        Ok(out)
    }

    /// Check the whole chain against `len` before releasing any of it
    fn free_chain(&self, head: PageId, len: usize) -> Result<()> {
        let pages = self.chain_pages(head, len)?;
        for &page in &pages {
            self.alloc.free(page)?;
        }
        trace!(%head, pages = pages.len(), "chain freed");
        Ok(())
    }

    fn chain_pages(&self, head: PageId, len: usize) -> Result<Vec<PageId>> {
        let count = len.div_ceil(CHAIN_CAPACITY);
        let mut pages = Vec::with_capacity(count);
        let mut page = head;
        for i in 0..count {
            if !page.is_valid() {
                return Err(StorageError::corruption(format!(
                    "chain at {head} is shorter than its length"
                )));
            }
            if !self.alloc.is_allocated(page)? {
                return Err(StorageError::invalid_operation(format!(
                    "chain page {page} is not allocated"
                )));
            }
            let frame = self.pool.fetch(page, LatchMode::Shared)?;
            let (next, chunk) = ChainPage::read(frame.data())?;
            let want = (len - i * CHAIN_CAPACITY).min(CHAIN_CAPACITY);
            if chunk.len() != want || (i + 1 == count && next.is_valid()) {
                return Err(StorageError::invalid_operation(format!(
                    "chain at {head} does not hold a {len} byte payload"
                )));
            }
            pages.push(page);
            page = next;
        }
        Ok(pages)
    }

    fn chain_stats(&self, head: PageId) -> Result<ChainStats> {
        let mut stats = ChainStats::default();
        let mut page = head;
        while page.is_valid() {
            let frame = self.pool.fetch(page, LatchMode::Shared)?;
            let fsm = FsmPage::open(frame.data())?;
            stats.fsm_pages += 1;
            stats.data_pages += fsm.len() as u32;
            stats.estimated_free_bytes += fsm
                .entries()
                .map(|e| e.estimate as u64 * FSM_UNIT as u64)
                .sum::<u64>();
            page = fsm.next();
        }
        Ok(stats)
    }
}

fn normal_vptr(page: PageId, slot: u16, data: &[u8]) -> VPtr {
    VPtr::Normal {
        page,
        slot,
        len: data.len() as u16,
    }
}
