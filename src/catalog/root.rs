//! Catalog root page.
//!
//! Layout:
//! ```text
//! Offset  Size  Description
//! 0       1     Page type flag (CatalogRoot)
//! 1       3     Reserved
//! 4       4     CRC32C of bytes 0..4 and 8..20
//! 8       4     Head of the value FSM chain
//! 12      4     Head of the key FSM chain
//! 16      4     Schema tree root (INVALID until set)
//! ```

use crate::error::{Result, StorageError};
use crate::page::{checksum, read_u32, write_u32};
use crate::types::{PageId, PageType, PAGE_SIZE};

const ROOT_END: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogRoot {
    pub value_fsm: PageId,
    pub key_fsm: PageId,
    pub schema_root: PageId,
}

impl CatalogRoot {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if PageType::of_page(bytes) != Some(PageType::CatalogRoot) {
            return Err(StorageError::invalid_db("catalog root page is not initialized"));
        }
        if read_u32(bytes, 4) != compute_checksum(bytes) {
            return Err(StorageError::corruption("catalog root checksum mismatch"));
        }
        Ok(Self {
            value_fsm: PageId::read_be(bytes, 8),
            key_fsm: PageId::read_be(bytes, 12),
            schema_root: PageId::read_be(bytes, 16),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..PAGE_SIZE].fill(0);
        bytes[0] = PageType::CatalogRoot as u8;
        self.value_fsm.write_be(bytes, 8);
        self.key_fsm.write_be(bytes, 12);
        self.schema_root.write_be(bytes, 16);
        let crc = compute_checksum(bytes);
        write_u32(bytes, 4, crc);
    }
}

fn compute_checksum(bytes: &[u8]) -> u32 {
    checksum(&[&bytes[..4], &bytes[8..ROOT_END]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_roundtrip_and_checksum() {
        let root = CatalogRoot {
            value_fsm: PageId::new(68),
            key_fsm: PageId::new(69),
            schema_root: PageId::INVALID,
        };
        let mut bytes = vec![0u8; PAGE_SIZE];
        root.write(&mut bytes);
        assert_eq!(CatalogRoot::read(&bytes).unwrap(), root);

        bytes[13] ^= 0x40;
        assert!(matches!(
            CatalogRoot::read(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }
}
