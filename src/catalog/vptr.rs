//! Logical pointers to stored payloads.

use crate::page::{read_u16, read_u32, write_u16, write_u32};
use crate::types::PageId;
use std::fmt;

/// Encoded size of a VPtr
pub const VPTR_SIZE: usize = 8;

/// Where a payload lives.
///
/// Both encodings are eight bytes; which one a stored pointer uses is
/// recorded by the caller alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum VPtr {
    /// A cell inside one slotted data page
    Normal { page: PageId, slot: u16, len: u16 },
    /// A chain of full pages starting at `head`
    Huge { head: PageId, len: u32 },
}

impl VPtr {
    /// The "not found" pointer
    pub const INVALID: VPtr = VPtr::Normal {
        page: PageId::INVALID,
        slot: 0,
        len: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.first_page().is_valid()
    }

    pub fn is_chained(&self) -> bool {
        matches!(self, VPtr::Huge { .. })
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match *self {
            VPtr::Normal { len, .. } => len as usize,
            VPtr::Huge { len, .. } => len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data page for normal pointers, chain head for huge ones
    pub fn first_page(&self) -> PageId {
        match *self {
            VPtr::Normal { page, .. } => page,
            VPtr::Huge { head, .. } => head,
        }
    }

    /// Big-endian encoding: page, then slot and length (normal) or length (huge)
    pub fn to_bytes(&self) -> [u8; VPTR_SIZE] {
        let mut out = [0u8; VPTR_SIZE];
        match *self {
            VPtr::Normal { page, slot, len } => {
                page.write_be(&mut out, 0);
                write_u16(&mut out, 4, slot);
                write_u16(&mut out, 6, len);
            }
            VPtr::Huge { head, len } => {
                head.write_be(&mut out, 0);
                write_u32(&mut out, 4, len);
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; VPTR_SIZE], chained: bool) -> Self {
        let page = PageId::read_be(bytes, 0);
        if chained {
            VPtr::Huge {
                head: page,
                len: read_u32(bytes, 4),
            }
        } else {
            VPtr::Normal {
                page,
                slot: read_u16(bytes, 4),
                len: read_u16(bytes, 6),
            }
        }
    }
}

impl fmt::Display for VPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VPtr::Normal { page, slot, len } => write!(f, "{page}:{slot} ({len} bytes)"),
            VPtr::Huge { head, len } => write!(f, "chain@{head} ({len} bytes)"),
        }
    }
}
