//! Common types and layout constants used throughout the storage engine.

mod page_id;

pub use page_id::PageId;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Pages tracked by one allocator group (two bitmap pages worth of bits)
pub const GROUP_SIZE: u32 = 65536;

/// Bitmap pages at the start of every group
pub const BITMAP_PAGES_PER_GROUP: u32 = 2;

/// Bits held by a single bitmap page
pub const BITS_PER_BITMAP_PAGE: u32 = (PAGE_SIZE * 8) as u32;

/// Size of the reserved anonymous address range (4 TiB)
pub const ANON_RESERVE_BYTES: u64 = 4 << 40;

/// Upper bound on groups: the anonymous reservation divided into groups
pub const MAX_GROUPS: u32 = (ANON_RESERVE_BYTES / PAGE_SIZE as u64 / GROUP_SIZE as u64) as u32;

/// Size of one on-disk group descriptor
pub const GROUP_DESCRIPTOR_SIZE: usize = 16;

/// Group descriptors per descriptor-table page
pub const DESCRIPTORS_PER_PAGE: u32 = (PAGE_SIZE / GROUP_DESCRIPTOR_SIZE) as u32;

/// First page of the group-descriptor table
pub const GDT_START: PageId = PageId(1);

/// Pages reserved for the group-descriptor table
pub const GDT_PAGES: u32 = MAX_GROUPS / DESCRIPTORS_PER_PAGE;

/// Fixed catalog root page
pub const CATALOG_PAGE: PageId = PageId(GDT_START.0 + GDT_PAGES);

/// First page owned by group 0
pub const HEAD_OFFSET: u32 = CATALOG_PAGE.0 + 1;

/// Default number of buffer pool frames
pub const DEFAULT_POOL_SIZE: usize = 1024;

/// Smallest pool the catalog can operate with (it pins a few pages at once)
pub const MIN_POOL_SIZE: usize = 8;

/// Page types
///
/// Every page owned by the catalog starts with one of these tags so that a
/// page is never interpreted through the wrong layout.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Fixed catalog root page
    CatalogRoot = 0xC1,
    /// Free-space-map index page
    FsmIndex = 0xF5,
    /// Slotted data page
    SlotHeap = 0x5D,
    /// Page in a huge-payload chain
    Chain = 0xCA,
}

impl PageType {
    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0xC1 => Some(Self::CatalogRoot),
            0xF5 => Some(Self::FsmIndex),
            0x5D => Some(Self::SlotHeap),
            0xCA => Some(Self::Chain),
            _ => None,
        }
    }

    /// Read the tag of a page, failing if the byte is unknown
    pub fn of_page(bytes: &[u8]) -> Option<Self> {
        bytes.first().copied().and_then(Self::from_byte)
    }
}
