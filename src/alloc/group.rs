//! Group descriptors and bitmap word addressing.
//!
//! A group is `GROUP_SIZE` consecutive pages whose first two pages are the
//! bitmaps tracking the whole group, themselves included. Bit `i` lives in
//! little-endian 64-bit word `i / 64`; words are numbered across both bitmap
//! pages.

use crate::page::{read_u32, write_u32};
use crate::types::{
    PageId, BITMAP_PAGES_PER_GROUP, BITS_PER_BITMAP_PAGE, GROUP_DESCRIPTOR_SIZE, GROUP_SIZE,
    HEAD_OFFSET, PAGE_SIZE,
};
use std::sync::atomic::{AtomicU32, Ordering};

/// 64-bit words in one bitmap page
pub const WORDS_PER_BITMAP_PAGE: u32 = BITS_PER_BITMAP_PAGE / 64;

/// 64-bit words across a group's bitmap pages
pub const WORDS_PER_GROUP: u32 = WORDS_PER_BITMAP_PAGE * BITMAP_PAGES_PER_GROUP;

/// Pages a fresh group can hand out
pub const USABLE_PAGES_PER_GROUP: u32 = GROUP_SIZE - BITMAP_PAGES_PER_GROUP;

/// In-memory group descriptor.
///
/// `free_pages` never exceeds the number of clear bits in the group: `alloc`
/// reserves from the counter before setting a bit and `free` clears a bit
/// before returning it to the counter. Ordering contract: loads `Acquire`,
/// stores `Release`, read-modify-writes `AcqRel`.
///
/// On-disk layout (16 bytes):
/// ```text
/// Offset  Size  Description
/// 0       4     First page of the group (its first bitmap page)
/// 4       4     Free page count
/// 8       4     Bitmap word most recently touched
/// 12      4     Reserved
/// ```
#[derive(Debug)]
pub struct GroupDescriptor {
    start: PageId,
    free_pages: AtomicU32,
    last_set: AtomicU32,
}

impl GroupDescriptor {
    /// Descriptor for a freshly laid out group
    pub fn fresh(index: u32) -> Self {
        Self {
            start: group_start(index),
            free_pages: AtomicU32::new(USABLE_PAGES_PER_GROUP),
            last_set: AtomicU32::new(0),
        }
    }

    /// Decode the descriptor for group `index` from a descriptor-table page.
    ///
    /// Returns `None` if the stored values cannot belong to that group.
    pub fn read(bytes: &[u8], index: u32) -> Option<Self> {
        let off = descriptor_offset(index);
        let start = PageId::read_be(bytes, off);
        let free_pages = read_u32(bytes, off + 4);
        let last_set = read_u32(bytes, off + 8);

        let sane = start == group_start(index)
            && free_pages <= USABLE_PAGES_PER_GROUP
            && last_set < WORDS_PER_GROUP;
        sane.then(|| Self {
            start,
            free_pages: AtomicU32::new(free_pages),
            last_set: AtomicU32::new(last_set),
        })
    }

    /// Encode into a descriptor-table page
    pub fn write(&self, bytes: &mut [u8], index: u32) {
        let off = descriptor_offset(index);
        self.start.write_be(bytes, off);
        write_u32(bytes, off + 4, self.free_pages());
        write_u32(bytes, off + 8, self.last_set());
        write_u32(bytes, off + 12, 0);
    }

    pub fn start(&self) -> PageId {
        self.start
    }

    /// The bitmap page holding `word`
    pub fn bitmap_page(&self, word: u32) -> PageId {
        PageId::new(self.start.value() + word / WORDS_PER_BITMAP_PAGE)
    }

    pub fn free_pages(&self) -> u32 {
        self.free_pages.load(Ordering::Acquire)
    }

    /// Take one page from the free counter; false if it is zero
    pub fn try_reserve(&self) -> bool {
        self.free_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Return one page to the free counter
    pub fn release(&self) {
        self.free_pages.fetch_add(1, Ordering::AcqRel);
    }

    pub fn last_set(&self) -> u32 {
        self.last_set.load(Ordering::Acquire)
    }

    pub fn set_last_set(&self, word: u32) {
        self.last_set.store(word, Ordering::Release);
    }
}

/// First page of group `index`
pub fn group_start(index: u32) -> PageId {
    PageId::new(HEAD_OFFSET + index * GROUP_SIZE)
}

/// Group index and bit within the group for a page past the metadata head
pub fn locate(page: PageId) -> Option<(u32, u32)> {
    let rel = page.value().checked_sub(HEAD_OFFSET)?;
    Some((rel / GROUP_SIZE, rel % GROUP_SIZE))
}

/// Descriptor-table page holding group `index`
pub fn descriptor_page(index: u32) -> u32 {
    index / (PAGE_SIZE / GROUP_DESCRIPTOR_SIZE) as u32
}

fn descriptor_offset(index: u32) -> usize {
    (index as usize % (PAGE_SIZE / GROUP_DESCRIPTOR_SIZE)) * GROUP_DESCRIPTOR_SIZE
}

/// Byte offset of `word` within its bitmap page
pub fn word_offset(word: u32) -> usize {
    (word % WORDS_PER_BITMAP_PAGE) as usize * 8
}

pub fn read_word(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

pub fn write_word(bytes: &mut [u8], offset: usize, word: u64) {
    bytes[offset..offset + 8].copy_from_slice(&word.to_le_bytes());
}

/// Lowest clear bit of a word, if any
pub fn first_zero(word: u64) -> Option<u32> {
    (word != u64::MAX).then(|| (!word).trailing_zeros())
}

/// Contents of the first bitmap page of a fresh group: the two bitmap pages
/// are marked used.
pub fn fresh_bitmap_head(bytes: &mut [u8]) {
    bytes[..PAGE_SIZE].fill(0);
    let used = (1u64 << BITMAP_PAGES_PER_GROUP) - 1;
    write_word(bytes, 0, used);
}
