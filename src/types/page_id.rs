//! Page identifier type.

use std::fmt;

/// Page number within the store.
///
/// Page 0 holds the allocator superblock; every page below
/// [`HEAD_OFFSET`](crate::types::HEAD_OFFSET) is fixed metadata.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct PageId(pub u32);

impl PageId {
    /// Invalid page ID, used as a sentinel value
    pub const INVALID: PageId = PageId(u32::MAX);

    /// The superblock page
    pub const SUPERBLOCK: PageId = PageId(0);

    /// Create a new page ID
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw page ID value
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Check if this is a valid page ID
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    /// Byte offset of this page in the backing store
    pub const fn byte_offset(self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }

    /// Decode a page pointer stored big-endian at `offset`
    pub fn read_be(bytes: &[u8], offset: usize) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[offset..offset + 4]);
        Self(u32::from_be_bytes(raw))
    }

    /// Encode this page pointer big-endian at `offset`
    pub fn write_be(self, bytes: &mut [u8], offset: usize) {
        bytes[offset..offset + 4].copy_from_slice(&self.0.to_be_bytes());
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "INVALID")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for PageId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<PageId> for u32 {
    fn from(id: PageId) -> Self {
        id.0
    }
}
