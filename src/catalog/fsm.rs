//! Free-space-map index pages.
//!
//! Layout:
//! ```text
//! Offset  Size  Description
//! 0       1     Page type flag (FsmIndex)
//! 1       1     Reserved
//! 2       2     Number of entries in use
//! 4       4     CRC32C of the rest of the page
//! 8       4     Next FSM index page (INVALID at the tail)
//! 12      4000  Entries: 1-byte free estimate, 4-byte data page
//! ```
//!
//! An estimate counts whole `FSM_UNIT`s of space the data page can reclaim,
//! rounded down, so a page never holds less than its entry promises.

use crate::error::{Result, StorageError};
use crate::page::{checksum, read_u16, read_u32, write_u16, write_u32, CELL_HEADER_SIZE, SLOT_SIZE};
use crate::types::{PageId, PageType, PAGE_SIZE};

/// Entries held by one index page
pub const FSM_ENTRIES_PER_PAGE: usize = 800;

/// Bytes represented by one step of an estimate
pub const FSM_UNIT: usize = PAGE_SIZE / 256;

const ENTRY_SIZE: usize = 5;
const ENTRIES_OFFSET: usize = 12;

/// Estimate recorded for a page with `reclaimable` bytes of space
pub fn estimate(reclaimable: usize) -> u8 {
    (reclaimable / FSM_UNIT).min(u8::MAX as usize) as u8
}

/// Smallest estimate that guarantees room for a `len`-byte record
pub fn units_needed(len: usize) -> usize {
    (len + SLOT_SIZE + CELL_HEADER_SIZE).div_ceil(FSM_UNIT)
}

/// One FSM entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmEntry {
    pub estimate: u8,
    pub page: PageId,
}

/// FSM index page view over a page buffer
pub struct FsmPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> FsmPage<B> {
    /// Interpret `buf` as an FSM page, verifying its tag and checksum
    pub fn open(buf: B) -> Result<Self> {
        let bytes = buf.as_ref();
        if PageType::of_page(bytes) != Some(PageType::FsmIndex) {
            return Err(StorageError::corruption("expected a free-space-map page"));
        }
        if read_u32(bytes, 4) != compute_checksum(bytes) {
            return Err(StorageError::corruption("free-space-map page checksum mismatch"));
        }
        if read_u16(bytes, 2) as usize > FSM_ENTRIES_PER_PAGE {
            return Err(StorageError::corruption("free-space-map entry count out of range"));
        }
        Ok(Self { buf })
    }

    pub fn len(&self) -> usize {
        read_u16(self.buf.as_ref(), 2) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == FSM_ENTRIES_PER_PAGE
    }

    pub fn next(&self) -> PageId {
        PageId::read_be(self.buf.as_ref(), 8)
    }

    pub fn entry(&self, index: usize) -> FsmEntry {
        let off = ENTRIES_OFFSET + index * ENTRY_SIZE;
        let bytes = self.buf.as_ref();
        FsmEntry {
            estimate: bytes[off],
            page: PageId::read_be(bytes, off + 1),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = FsmEntry> + '_ {
        (0..self.len()).map(move |i| self.entry(i))
    }

    /// First entry at or after `from` whose estimate is at least `units`
    pub fn find(&self, from: usize, units: usize) -> Option<(usize, FsmEntry)> {
        (from..self.len())
            .map(|i| (i, self.entry(i)))
            .find(|(_, e)| e.estimate as usize >= units)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> FsmPage<B> {
    /// Format `buf` as an empty FSM page at the tail of its chain
    pub fn init(mut buf: B) -> Self {
        let bytes = buf.as_mut();
        bytes.fill(0);
        bytes[0] = PageType::FsmIndex as u8;
        PageId::INVALID.write_be(bytes, 8);
        let mut page = Self { buf };
        page.seal();
        page
    }

    /// Append an entry, returning its index, or `None` when the page is full
    pub fn push(&mut self, estimate: u8, page: PageId) -> Option<u16> {
        let index = self.len();
        if index >= FSM_ENTRIES_PER_PAGE {
            return None;
        }
        let off = ENTRIES_OFFSET + index * ENTRY_SIZE;
        let bytes = self.buf.as_mut();
        bytes[off] = estimate;
        page.write_be(bytes, off + 1);
        write_u16(bytes, 2, index as u16 + 1);
        self.seal();
        Some(index as u16)
    }

    pub fn set_estimate(&mut self, index: usize, estimate: u8) {
        debug_assert!(index < self.len());
        self.buf.as_mut()[ENTRIES_OFFSET + index * ENTRY_SIZE] = estimate;
        self.seal();
    }

    pub fn set_next(&mut self, next: PageId) {
        next.write_be(self.buf.as_mut(), 8);
        self.seal();
    }

    fn seal(&mut self) {
        let crc = compute_checksum(self.buf.as_ref());
        write_u32(self.buf.as_mut(), 4, crc);
    }
}

fn compute_checksum(bytes: &[u8]) -> u32 {
    checksum(&[&bytes[..4], &bytes[8..PAGE_SIZE]])
}
