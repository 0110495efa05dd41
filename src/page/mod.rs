//! Page layer: byte layouts of the pages the catalog owns.
//!
//! Pages live in buffer-pool frames as raw bytes. The types here are views
//! over those bytes that check the page-type tag before interpreting them:
//! - `SlotHeap`: slotted data page with a slot table growing up and
//!   variable-length cells growing down from the end of the page
//! - `ChainPage`: one link of a huge-payload chain

mod chain;
mod header;
mod slotted;

pub use chain::{ChainPage, CHAIN_CAPACITY, CHAIN_HEADER_SIZE};
pub use header::{HeapHeader, HEAP_HEADER_SIZE};
pub use slotted::{SlotHeap, CELL_HEADER_SIZE, SLOT_SIZE, TOMBSTONE};

use crate::types::PAGE_SIZE;

/// A raw page buffer
#[derive(Clone)]
pub struct PageBuf {
    data: [u8; PAGE_SIZE],
}

impl PageBuf {
    /// Create a new zeroed page buffer
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Get a reference to the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get a mutable reference to the raw bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl AsRef<[u8]> for PageBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for PageBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// CRC32C over several disjoint regions of a page, in order
pub fn checksum(parts: &[&[u8]]) -> u32 {
    parts
        .iter()
        .fold(0u32, |crc, part| crc32c::crc32c_append(crc, part))
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_matches_contiguous_crc() {
        let data = b"page engine checksum";
        assert_eq!(checksum(&[&data[..5], &data[5..]]), crc32c::crc32c(data));
    }

    #[test]
    fn test_integer_helpers() {
        let mut buf = [0u8; 8];
        write_u16(&mut buf, 0, 0xBEEF);
        write_u32(&mut buf, 2, 0xDEAD_BEEF);
        assert_eq!(read_u16(&buf, 0), 0xBEEF);
        assert_eq!(read_u32(&buf, 2), 0xDEAD_BEEF);
    }
}
