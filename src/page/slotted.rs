//! Slotted page implementation.
//!
//! A slotted page uses the following layout:
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                    Page Header                      │
//! ├────────────────────────────────────────────────────┤
//! │                     Slot Table                      │
//! │  [slot0][slot1][slot2]...      →                   │
//! ├────────────────────────────────────────────────────┤
//! │                                                    │
//! │                   Free Space                        │
//! │                                                    │
//! ├────────────────────────────────────────────────────┤
//! │                     Cell Heap                       │
//! │      ←  [cell2][cell1][cell0]                      │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! A slot holds the offset of its cell, or `TOMBSTONE` once freed. Slot
//! indices are stable: they are handed out in VPtrs, so freeing never shifts
//! the table. A cell is a u16 length followed by the payload.
//!
//! Freed cells leave fragmented bytes behind. When they reach a quarter of
//! the page the heap is compacted.

use crate::error::{Result, StorageError};
use crate::page::{read_u16, write_u16, HeapHeader, HEAP_HEADER_SIZE};
use crate::types::{PageId, PAGE_SIZE};

/// Slot value marking a freed slot
pub const TOMBSTONE: u16 = 0xFFFF;

/// Bytes used by one slot table entry
pub const SLOT_SIZE: usize = 2;

/// Bytes of cell overhead in front of the payload
pub const CELL_HEADER_SIZE: usize = 2;

/// Fragmentation level that triggers compaction
const DEFRAG_THRESHOLD: usize = PAGE_SIZE / 4;

/// A slotted page view over a page buffer
pub struct SlotHeap<B> {
    buf: B,
    /// Cached header (kept in sync with the buffer)
    header: HeapHeader,
}

impl<B: AsRef<[u8]>> SlotHeap<B> {
    /// Interpret `buf` as a slotted page
    pub fn open(buf: B) -> Result<Self> {
        let header = HeapHeader::read(buf.as_ref())
            .ok_or_else(|| StorageError::invalid_page("not a slotted data page"))?;
        Ok(Self { buf, header })
    }

    pub fn header(&self) -> &HeapHeader {
        &self.header
    }

    pub fn slot_count(&self) -> u16 {
        self.header.slot_count
    }

    pub fn frag_bytes(&self) -> usize {
        self.header.frag_bytes as usize
    }

    /// FSM page and entry that describe this page
    pub fn fsm_owner(&self) -> (PageId, u16) {
        (self.header.fsm_page, self.header.fsm_entry)
    }

    /// Bytes an insert could use, counting space compaction would recover
    pub fn reclaimable(&self) -> usize {
        self.header.gap() + self.header.frag_bytes as usize
    }

    /// Largest payload an insert is guaranteed to fit right now
    pub fn max_payload(&self) -> usize {
        self.reclaimable()
            .saturating_sub(SLOT_SIZE + CELL_HEADER_SIZE)
    }

    fn slot(&self, index: u16) -> u16 {
        read_u16(self.buf.as_ref(), self.header.start as usize + index as usize * SLOT_SIZE)
    }

    /// Number of slots that hold a cell
    pub fn live_count(&self) -> usize {
        (0..self.header.slot_count)
            .filter(|&i| self.slot(i) != TOMBSTONE)
            .count()
    }

    /// Payload of the cell in `slot`
    pub fn get(&self, slot: u16) -> Result<&[u8]> {
        let bytes = self.buf.as_ref();
        let offset = self.cell_offset(slot)?;
        let len = read_u16(bytes, offset) as usize;
        let start = offset + CELL_HEADER_SIZE;
        if start + len > PAGE_SIZE {
            return Err(StorageError::corruption(format!(
                "cell in slot {} overruns the page",
                slot
            )));
        }
        Ok(&bytes[start..start + len])
    }

    fn cell_offset(&self, slot: u16) -> Result<usize> {
        if slot >= self.header.slot_count {
            return Err(StorageError::invalid_operation(format!(
                "slot {} out of bounds (count: {})",
                slot, self.header.slot_count
            )));
        }
        let offset = self.slot(slot);
        if offset == TOMBSTONE {
            return Err(StorageError::invalid_operation(format!(
                "slot {} is free",
                slot
            )));
        }
        let offset = offset as usize;
        if offset < self.header.free_offset as usize || offset + CELL_HEADER_SIZE > PAGE_SIZE {
            return Err(StorageError::corruption(format!(
                "slot {} points outside the cell heap",
                slot
            )));
        }
        Ok(offset)
    }

    fn cell_size(&self, offset: usize) -> usize {
        CELL_HEADER_SIZE + read_u16(self.buf.as_ref(), offset) as usize
    }

    pub fn into_inner(self) -> B {
        self.buf
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlotHeap<B> {
    /// Format `buf` as an empty slotted page owned by the given FSM entry
    pub fn init(mut buf: B, fsm_page: PageId, fsm_entry: u16) -> Self {
        let bytes = buf.as_mut();
        bytes.fill(0);
        let header = HeapHeader::new(fsm_page, fsm_entry);
        header.write(bytes);
        Self { buf, header }
    }

    /// Store `data` in a new cell, returning its slot.
    ///
    /// Returns `None` if the page cannot hold it even after compaction.
    pub fn insert(&mut self, data: &[u8]) -> Option<u16> {
        let cell_size = CELL_HEADER_SIZE + data.len();
        if data.len() > u16::MAX as usize {
            return None;
        }

        let reuse = (0..self.header.slot_count).find(|&i| self.slot(i) == TOMBSTONE);
        let needed = cell_size + if reuse.is_some() { 0 } else { SLOT_SIZE };

        if self.header.gap() < needed {
            if self.reclaimable() < needed {
                return None;
            }
            self.defragment();
        }

        let offset = self.header.free_offset as usize - cell_size;
        let bytes = self.buf.as_mut();
        write_u16(bytes, offset, data.len() as u16);
        bytes[offset + CELL_HEADER_SIZE..offset + cell_size].copy_from_slice(data);

        let slot = match reuse {
            Some(slot) => slot,
            None => {
                self.header.slot_count += 1;
                self.header.slot_count - 1
            }
        };
        self.set_slot(slot, offset as u16);
        self.header.free_offset = offset as u16;
        self.sync_header();

        Some(slot)
    }

    /// Free the cell in `slot`, returning the bytes it occupied.
    ///
    /// Compacts the page once fragmentation reaches a quarter of the page.
    pub fn free(&mut self, slot: u16) -> Result<usize> {
        let offset = self.cell_offset(slot)?;
        let size = self.cell_size(offset);

        self.set_slot(slot, TOMBSTONE);
        if offset == self.header.free_offset as usize {
            // lowest cell: give its bytes straight back to the gap
            self.header.free_offset += size as u16;
        } else {
            self.header.frag_bytes += size as u16;
        }

        while self.header.slot_count > 0 && self.slot(self.header.slot_count - 1) == TOMBSTONE {
            self.header.slot_count -= 1;
        }
        self.sync_header();

        if self.header.frag_bytes as usize >= DEFRAG_THRESHOLD {
            self.defragment();
        }
        Ok(size)
    }

    /// Repack live cells against the end of the page in slot order
    pub fn defragment(&mut self) {
        let snapshot = self.buf.as_ref().to_vec();
        let mut top = PAGE_SIZE;

        for slot in 0..self.header.slot_count {
            let offset = self.slot(slot);
            if offset == TOMBSTONE {
                continue;
            }
            let offset = offset as usize;
            let size = CELL_HEADER_SIZE + read_u16(&snapshot, offset) as usize;
            top -= size;
            self.buf.as_mut()[top..top + size].copy_from_slice(&snapshot[offset..offset + size]);
            self.set_slot(slot, top as u16);
        }

        self.header.free_offset = top as u16;
        self.header.frag_bytes = 0;
        self.sync_header();
    }

    fn set_slot(&mut self, index: u16, value: u16) {
        let at = self.header.start as usize + index as usize * SLOT_SIZE;
        write_u16(self.buf.as_mut(), at, value);
    }

    /// Sync the header to the raw page data
    fn sync_header(&mut self) {
        self.header.write(self.buf.as_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageBuf;

    fn empty() -> SlotHeap<PageBuf> {
        SlotHeap::init(PageBuf::new(), PageId::new(70), 3)
    }

    #[test]
    fn test_new_page() {
        let page = empty();
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.reclaimable(), PAGE_SIZE - HEAP_HEADER_SIZE);
        assert_eq!(page.fsm_owner(), (PageId::new(70), 3));
    }

    #[test]
    fn test_insert_and_get() {
        let mut page = empty();

        let a = page.insert(b"banana").unwrap();
        let b = page.insert(b"").unwrap();
        let c = page.insert(b"cherry").unwrap();

        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(page.get(a).unwrap(), b"banana");
        assert_eq!(page.get(b).unwrap(), b"");
        assert_eq!(page.get(c).unwrap(), b"cherry");
    }

    #[test]
    fn test_free_reuses_tombstone() {
        let mut page = empty();
        page.insert(b"a").unwrap();
        let b = page.insert(b"bb").unwrap();
        page.insert(b"c").unwrap();

        page.free(b).unwrap();
        assert!(page.get(b).is_err());
        assert!(page.free(b).is_err());
        assert_eq!(page.insert(b"dd"), Some(b));
        assert_eq!(page.live_count(), 3);
    }

    #[test]
    fn test_trailing_tombstones_are_trimmed() {
        let mut page = empty();
        page.insert(b"a").unwrap();
        let b = page.insert(b"b").unwrap();
        let c = page.insert(b"c").unwrap();
        page.free(b).unwrap();
        page.free(c).unwrap();
        assert_eq!(page.slot_count(), 1);
    }

    #[test]
    fn test_full_page_rejects_insert() {
        let mut page = empty();
        let payload = [9u8; 1000];
        let mut n = 0;
        while page.insert(&payload).is_some() {
            n += 1;
        }
        assert_eq!(n, 4);
        assert!(page.max_payload() < payload.len());
        assert!(page.insert(&[1u8; 8]).is_some());
    }

    #[test]
    fn test_fragmentation_triggers_defragment() {
        let mut page = empty();
        let slots: Vec<u16> = (0..40u8)
            .map(|i| page.insert(&[i; 60]).unwrap())
            .collect();

        // free every other cell, never the lowest one
        let mut compacted = false;
        for &slot in slots.iter().step_by(2) {
            let before = page.frag_bytes();
            page.free(slot).unwrap();
            if page.frag_bytes() < before {
                compacted = true;
                break;
            }
        }

        assert!(compacted);
        assert_eq!(page.frag_bytes(), 0);
        for (i, &slot) in slots.iter().enumerate() {
            if let Ok(data) = page.get(slot) {
                assert_eq!(data, &[i as u8; 60][..]);
            }
        }
        for (i, &slot) in slots.iter().enumerate().skip(1).step_by(2) {
            assert_eq!(page.get(slot).unwrap(), &[i as u8; 60][..]);
        }
    }

    #[test]
    fn test_insert_compacts_when_gap_too_small() {
        let mut page = empty();
        let slots: Vec<u16> = (0..4u8).map(|i| page.insert(&[i; 900]).unwrap()).collect();
        // frees below the quarter-page threshold leave fragmentation behind
        page.free(slots[1]).unwrap();
        assert_eq!(page.frag_bytes(), 902);
        assert!(page.header().gap() < 902);

        let slot = page.insert(&[7u8; 900]).unwrap();
        assert_eq!(slot, slots[1]);
        assert_eq!(page.frag_bytes(), 0);
        assert_eq!(page.get(slots[0]).unwrap(), &[0u8; 900][..]);
        assert_eq!(page.get(slots[3]).unwrap(), &[3u8; 900][..]);
    }

    #[test]
    fn test_open_roundtrip() {
        let mut page = empty();
        page.insert(b"test data").unwrap();

        let bytes = page.into_inner();
        let restored = SlotHeap::open(bytes.as_bytes()).unwrap();
        assert_eq!(restored.slot_count(), 1);
        assert_eq!(restored.get(0).unwrap(), b"test data");
        assert!(SlotHeap::open(&[0u8; PAGE_SIZE][..]).is_err());
    }
}
