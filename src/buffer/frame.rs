//! Buffer pool frame.
//!
//! Shared counters are atomics behind accessors. Ordering contract: loads use
//! `Acquire`, stores use `Release`, read-modify-writes use `AcqRel`.

use crate::latch::Latch;
use crate::page::PageBuf;
use crate::types::PageId;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub(crate) struct Frame {
    page_id: AtomicU32,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    /// Clock-sweep recency bit
    referenced: AtomicBool,
    pub(crate) latch: Latch,
    data: UnsafeCell<PageBuf>,
}

// SAFETY: `data` is only touched while holding `latch` in a mode that
// permits the access (or, for a victim being swapped in, with the pool's
// table latch held exclusively and the frame unpinned).
unsafe impl Sync for Frame {}

impl Frame {
    pub(crate) fn new() -> Self {
        Self {
            page_id: AtomicU32::new(PageId::INVALID.value()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            referenced: AtomicBool::new(false),
            latch: Latch::new(),
            data: UnsafeCell::new(PageBuf::new()),
        }
    }

    pub(crate) fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    pub(crate) fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.value(), Ordering::Release);
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one pin; returns false if the frame was not pinned
    pub(crate) fn unpin(&self) -> bool {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Reset metadata for a freshly loaded page: one pin, referenced, clean
    pub(crate) fn install(&self, page_id: PageId) {
        self.set_page_id(page_id);
        self.dirty.store(false, Ordering::Release);
        self.referenced.store(true, Ordering::Release);
        self.pin_count.store(1, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.set_page_id(PageId::INVALID);
        self.dirty.store(false, Ordering::Release);
        self.referenced.store(false, Ordering::Release);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn touch(&self) {
        self.referenced.store(true, Ordering::Release);
    }

    /// Clear the recency bit, returning whether it was set
    pub(crate) fn take_reference(&self) -> bool {
        self.referenced.swap(false, Ordering::AcqRel)
    }

    /// # Safety
    /// The caller holds the frame latch in any mode, or owns the frame as an
    /// unpinned victim.
    pub(crate) unsafe fn data(&self) -> &[u8] {
        (*self.data.get()).as_bytes()
    }

    /// # Safety
    /// The caller holds the frame latch exclusively, or owns the frame as an
    /// unpinned victim.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut [u8] {
        (*self.data.get()).as_bytes_mut()
    }
}
