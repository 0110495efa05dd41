//! Anonymous memory backing for the page store.
//!
//! The whole address range is reserved once with `PROT_NONE`; growing only
//! flips the protection of the next slice to read/write. The base address
//! never moves, so nothing above the store has to re-derive pointers after a
//! grow.

use std::io;
use std::ptr::{self, NonNull};

pub(crate) struct AnonRegion {
    base: NonNull<u8>,
    reserved: usize,
    os_page: usize,
}

// SAFETY: the region is plain memory; concurrent access to distinct pages is
// coordinated by the buffer pool, and growth is serialized by the store.
unsafe impl Send for AnonRegion {}
unsafe impl Sync for AnonRegion {}

impl AnonRegion {
    /// Reserve `bytes` of address space without backing it
    pub(crate) fn reserve(bytes: usize) -> io::Result<Self> {
        // SAFETY: a fresh private anonymous mapping aliases nothing.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        // SAFETY: sysconf has no memory-safety preconditions.
        let os_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let os_page = if os_page > 0 { os_page as usize } else { 4096 };

        Ok(Self {
            base,
            reserved: bytes,
            os_page,
        })
    }

    pub(crate) fn reserved(&self) -> usize {
        self.reserved
    }

    /// Make `[from, to)` readable and writable
    pub(crate) fn commit(&self, from: usize, to: usize) -> io::Result<()> {
        if to > self.reserved {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "anonymous reservation exhausted",
            ));
        }
        let start = from - from % self.os_page;
        let end = to.div_ceil(self.os_page) * self.os_page;
        let end = end.min(self.reserved);
        if end <= start {
            return Ok(());
        }
        // SAFETY: [start, end) lies inside our own mapping.
        let rc = unsafe {
            libc::mprotect(
                self.base.as_ptr().add(start).cast(),
                end - start,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes out of the region.
    ///
    /// # Safety
    /// `[offset, offset + buf.len())` must be committed.
    pub(crate) unsafe fn read(&self, offset: usize, buf: &mut [u8]) {
        ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
    }

    /// Copy `data` into the region.
    ///
    /// # Safety
    /// `[offset, offset + data.len())` must be committed.
    pub(crate) unsafe fn write(&self, offset: usize, data: &[u8]) {
        ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr().add(offset), data.len());
    }
}

impl Drop for AnonRegion {
    fn drop(&mut self) {
        // SAFETY: base/reserved describe the mapping created in `reserve`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.reserved);
        }
    }
}
