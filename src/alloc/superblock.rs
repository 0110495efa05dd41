//! Allocator superblock.
//!
//! Page 0 of the store describes how many groups exist and carries the
//! checksums that protect the group-descriptor table.

use crate::error::{Result, StorageError};
use crate::page::{checksum, read_u32, write_u32};
use crate::types::{
    CATALOG_PAGE, GDT_PAGES, GDT_START, GROUP_SIZE, HEAD_OFFSET, MAX_GROUPS, PAGE_SIZE,
};

/// Magic number identifying an allocator superblock
pub const MAGIC: u32 = 0x5349_4D44;

/// Current on-disk format version
pub const VERSION: u32 = 1;

/// Bytes covered by the header checksum
const HEADER_LEN: usize = 32;

/// Offset of the per-descriptor-page checksum array
const GDT_CRC_OFFSET: usize = 36;

/// Allocator superblock
///
/// Layout:
/// ```text
/// Offset  Size  Description
/// 0       4     Magic (0x53494D44)
/// 4       4     Format version
/// 8       4     Page size (currently always 4096)
/// 12      4     Total page count
/// 16      4     Total group count
/// 20      4     First group-descriptor page
/// 24      4     Group-descriptor page count
/// 28      4     Catalog root page
/// 32      4     CRC32C of bytes 0..32
/// 36      256   CRC32C of each group-descriptor page
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Pages covered by the allocator, metadata included
    pub total_pages: u32,
    /// Number of groups laid out
    pub total_groups: u32,
    /// Checksum of every group-descriptor page
    pub gdt_checksums: Vec<u32>,
}

impl Superblock {
    /// Superblock for a store with a single group
    pub fn new() -> Self {
        Self {
            total_pages: HEAD_OFFSET + GROUP_SIZE,
            total_groups: 1,
            gdt_checksums: vec![0; GDT_PAGES as usize],
        }
    }

    /// Page count implied by a group count
    pub fn pages_for_groups(groups: u32) -> u32 {
        HEAD_OFFSET + groups * GROUP_SIZE
    }

    /// Read and validate a superblock
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PAGE_SIZE {
            return Err(StorageError::invalid_db("superblock too short"));
        }

        if read_u32(bytes, 0) != MAGIC {
            return Err(StorageError::invalid_db("invalid magic number"));
        }

        let stored_checksum = read_u32(bytes, HEADER_LEN);
        if stored_checksum != checksum(&[&bytes[..HEADER_LEN]]) {
            return Err(StorageError::corruption("superblock checksum mismatch"));
        }

        let version = read_u32(bytes, 4);
        if version != VERSION {
            return Err(StorageError::invalid_db(format!(
                "unsupported format version: {version} (expected {VERSION})"
            )));
        }

        let page_size = read_u32(bytes, 8);
        if page_size != PAGE_SIZE as u32 {
            return Err(StorageError::invalid_db(format!(
                "unsupported page size: {} (expected {})",
                page_size, PAGE_SIZE
            )));
        }

        if read_u32(bytes, 20) != GDT_START.value()
            || read_u32(bytes, 24) != GDT_PAGES
            || read_u32(bytes, 28) != CATALOG_PAGE.value()
        {
            return Err(StorageError::invalid_db("unexpected metadata layout"));
        }

        let total_pages = read_u32(bytes, 12);
        let total_groups = read_u32(bytes, 16);
        if total_groups == 0
            || total_groups > MAX_GROUPS
            || total_pages != Self::pages_for_groups(total_groups)
        {
            return Err(StorageError::invalid_db(format!(
                "page count {total_pages} does not match {total_groups} groups"
            )));
        }

        let gdt_checksums = (0..GDT_PAGES as usize)
            .map(|i| read_u32(bytes, GDT_CRC_OFFSET + i * 4))
            .collect();

        Ok(Self {
            total_pages,
            total_groups,
            gdt_checksums,
        })
    }

    /// Write this superblock to bytes, computing the header checksum
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..PAGE_SIZE].fill(0);

        write_u32(bytes, 0, MAGIC);
        write_u32(bytes, 4, VERSION);
        write_u32(bytes, 8, PAGE_SIZE as u32);
        write_u32(bytes, 12, self.total_pages);
        write_u32(bytes, 16, self.total_groups);
        write_u32(bytes, 20, GDT_START.value());
        write_u32(bytes, 24, GDT_PAGES);
        write_u32(bytes, 28, CATALOG_PAGE.value());

        let crc = checksum(&[&bytes[..HEADER_LEN]]);
        write_u32(bytes, HEADER_LEN, crc);

        for (i, crc) in self.gdt_checksums.iter().enumerate() {
            write_u32(bytes, GDT_CRC_OFFSET + i * 4, *crc);
        }
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}
