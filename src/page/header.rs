//! Slotted page header structure.
//!
//! The header occupies the first bytes of each slotted data page and
//! describes where the slot table ends and the cell heap begins.

use crate::page::{read_u16, write_u16};
use crate::types::{PageId, PageType, PAGE_SIZE};

/// Size of the slotted page header
pub const HEAP_HEADER_SIZE: usize = 16;

/// Slotted page header
///
/// Layout (16 bytes):
/// ```text
/// Offset  Size  Description
/// 0       1     Page type flag (SlotHeap)
/// 1       1     Reserved
/// 2       2     Offset of the slot table
/// 4       2     Number of slots (live and tombstoned)
/// 6       2     Offset of the lowest cell (start of the cell heap)
/// 8       2     Fragmented bytes left behind by freed cells
/// 10      4     FSM index page that describes this page
/// 14      2     Entry index within that FSM page
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapHeader {
    /// Offset of the slot table
    pub start: u16,
    /// Number of slots, including tombstones
    pub slot_count: u16,
    /// Offset of the lowest cell
    pub free_offset: u16,
    /// Bytes of freed cells not yet reclaimed
    pub frag_bytes: u16,
    /// Owning FSM index page
    pub fsm_page: PageId,
    /// Entry index within the owning FSM page
    pub fsm_entry: u16,
}

impl HeapHeader {
    /// Header for an empty page owned by the given FSM entry
    pub fn new(fsm_page: PageId, fsm_entry: u16) -> Self {
        Self {
            start: HEAP_HEADER_SIZE as u16,
            slot_count: 0,
            free_offset: PAGE_SIZE as u16,
            frag_bytes: 0,
            fsm_page,
            fsm_entry,
        }
    }

    /// Read a header from bytes, rejecting pages that are not slotted pages
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PAGE_SIZE || PageType::of_page(bytes) != Some(PageType::SlotHeap) {
            return None;
        }

        let header = Self {
            start: read_u16(bytes, 2),
            slot_count: read_u16(bytes, 4),
            free_offset: read_u16(bytes, 6),
            frag_bytes: read_u16(bytes, 8),
            fsm_page: PageId::read_be(bytes, 10),
            fsm_entry: read_u16(bytes, 14),
        };

        let sane = header.start as usize == HEAP_HEADER_SIZE
            && header.slot_table_end() <= header.free_offset as usize
            && header.free_offset as usize <= PAGE_SIZE
            && (header.frag_bytes as usize) < PAGE_SIZE;
        sane.then_some(header)
    }

    /// Write this header to bytes
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0] = PageType::SlotHeap as u8;
        bytes[1] = 0;
        write_u16(bytes, 2, self.start);
        write_u16(bytes, 4, self.slot_count);
        write_u16(bytes, 6, self.free_offset);
        write_u16(bytes, 8, self.frag_bytes);
        self.fsm_page.write_be(bytes, 10);
        write_u16(bytes, 14, self.fsm_entry);
    }

    /// End of the slot table
    pub fn slot_table_end(&self) -> usize {
        self.start as usize + self.slot_count as usize * 2
    }

    /// Contiguous gap between the slot table and the cell heap
    pub fn gap(&self) -> usize {
        (self.free_offset as usize).saturating_sub(self.slot_table_end())
    }
}
