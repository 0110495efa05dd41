//! Chain pages for payloads above the normal-data limit.
//!
//! Layout:
//! ```text
//! Offset  Size  Description
//! 0       1     Page type flag (Chain)
//! 1       1     Reserved
//! 2       2     Bytes of the data area in use
//! 4       4     Next page in the chain (INVALID at the tail)
//! 8       4     CRC32C of bytes 0..8 and the data area
//! 12      4084  Data area
//! ```
//!
//! Every page but the tail is full. The tail's unused data bytes are zero.

use crate::error::{Result, StorageError};
use crate::page::{checksum, read_u16, read_u32, write_u16, write_u32};
use crate::types::{PageId, PageType, PAGE_SIZE};

/// Bytes in front of the data area
pub const CHAIN_HEADER_SIZE: usize = 12;

/// Payload bytes carried by one chain page
pub const CHAIN_CAPACITY: usize = PAGE_SIZE - CHAIN_HEADER_SIZE;

/// Accessors for a chain page
pub struct ChainPage;

impl ChainPage {
    /// Format `bytes` as a chain page holding `chunk` and linking to `next`
    pub fn write(bytes: &mut [u8], next: PageId, chunk: &[u8]) {
        debug_assert!(chunk.len() <= CHAIN_CAPACITY);
        bytes[..CHAIN_HEADER_SIZE].fill(0);
        bytes[0] = PageType::Chain as u8;
        write_u16(bytes, 2, chunk.len() as u16);
        next.write_be(bytes, 4);
        bytes[CHAIN_HEADER_SIZE..CHAIN_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        bytes[CHAIN_HEADER_SIZE + chunk.len()..PAGE_SIZE].fill(0);
        let crc = Self::compute_checksum(bytes);
        write_u32(bytes, 8, crc);
    }

    /// Verify a chain page and return its next pointer and the bytes in use
    pub fn read(bytes: &[u8]) -> Result<(PageId, &[u8])> {
        if PageType::of_page(bytes) != Some(PageType::Chain) {
            return Err(StorageError::corruption("page in chain is not a chain page"));
        }
        let stored = read_u32(bytes, 8);
        if stored != Self::compute_checksum(bytes) {
            return Err(StorageError::corruption("chain page checksum mismatch"));
        }
        let used = read_u16(bytes, 2) as usize;
        if used > CHAIN_CAPACITY {
            return Err(StorageError::corruption(format!(
                "chain page claims {used} bytes in use"
            )));
        }
        Ok((
            PageId::read_be(bytes, 4),
            &bytes[CHAIN_HEADER_SIZE..CHAIN_HEADER_SIZE + used],
        ))
    }

    fn compute_checksum(bytes: &[u8]) -> u32 {
        checksum(&[&bytes[..8], &bytes[CHAIN_HEADER_SIZE..PAGE_SIZE]])
    }
}
