//! Page store implementation.
//!
//! The page store moves whole pages between memory and the backing store. It
//! does no caching; the only policy it owns is serializing growth. The I/O
//! operations sit behind a trait so that the rest of the system can be tested
//! with instrumented or mock implementations.

use crate::error::{Result, StorageError};
use crate::storage::anon::AnonRegion;
use crate::types::{PageId, ANON_RESERVE_BYTES, PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Trait for page I/O operations
///
/// This abstraction allows swapping the storage backend or instrumenting it for tests.
pub trait PageStore: Send + Sync {
    /// Read a page into `buf` (exactly one page long)
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Write one page of `data`
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Extend the store by `additional_pages`, returning the new page count
    fn grow(&self, additional_pages: u32) -> Result<u32>;

    /// Force written pages to durable storage
    fn sync(&self) -> Result<()>;

    /// Current size in pages
    fn page_count(&self) -> u32;

    /// Page transfer counters
    fn io_stats(&self) -> IoStats;
}

/// Counts of page transfers performed by a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
}

/// Options for creating or opening a store
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Follow every page write with `sync_data` (file backing only)
    pub sync_on_write: bool,
    /// Address space reserved for the anonymous backing
    pub anon_reserve_bytes: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            sync_on_write: false,
            anon_reserve_bytes: ANON_RESERVE_BYTES,
        }
    }
}

enum Backing {
    File(File),
    Anonymous(AnonRegion),
}

/// Page store over a file or an anonymous memory reservation
pub struct PageStoreImpl {
    backing: Backing,
    path: Option<PathBuf>,
    /// Logical size in bytes, always a multiple of PAGE_SIZE
    size: AtomicU64,
    /// Serializes growth; distinct from every latch above the store
    grow_lock: Mutex<()>,
    sync_on_write: bool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl PageStoreImpl {
    /// Create a fresh store with `initial_pages` zeroed pages.
    ///
    /// `None` selects the anonymous backing. An existing file is truncated.
    pub fn create(path: Option<&Path>, initial_pages: u32, options: StoreOptions) -> Result<Self> {
        let store = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                info!(path = %path.display(), initial_pages, "created file page store");
                Self::with_backing(Backing::File(file), Some(path.to_path_buf()), 0, options)
            }
            None => {
                let reserve = usize::try_from(options.anon_reserve_bytes)
                    .map_err(|_| StorageError::invalid_operation("reservation exceeds address space"))?;
                let region = AnonRegion::reserve(reserve)?;
                info!(reserve, initial_pages, "created anonymous page store");
                Self::with_backing(Backing::Anonymous(region), None, 0, options)
            }
        };
        if initial_pages > 0 {
            store.grow(initial_pages)?;
        }
        Ok(store)
    }

    /// Open an existing file-backed store
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(StorageError::invalid_db(format!(
                "file length {} is not a multiple of the page size {}",
                len, PAGE_SIZE
            )));
        }
        info!(path = %path.display(), pages = len / PAGE_SIZE as u64, "opened file page store");
        Ok(Self::with_backing(
            Backing::File(file),
            Some(path.to_path_buf()),
            len,
            options,
        ))
    }

    fn with_backing(backing: Backing, path: Option<PathBuf>, size: u64, options: StoreOptions) -> Self {
        Self {
            backing,
            path,
            size: AtomicU64::new(size),
            grow_lock: Mutex::new(()),
            sync_on_write: options.sync_on_write,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Whether the store lives in anonymous memory
    pub fn is_anonymous(&self) -> bool {
        matches!(self.backing, Backing::Anonymous(_))
    }

    /// Sync (file backing) and release the store
    pub fn close(self) -> Result<()> {
        self.sync()?;
        info!(path = ?self.path, "closed page store");
        Ok(())
    }

    fn check_access(&self, page_id: PageId, len: usize) -> Result<u64> {
        if len != PAGE_SIZE {
            return Err(StorageError::invalid_operation(format!(
                "page buffer must be {} bytes, got {}",
                PAGE_SIZE, len
            )));
        }
        if !page_id.is_valid() {
            return Err(StorageError::PageNotFound(page_id));
        }
        let offset = page_id.byte_offset(PAGE_SIZE);
        if offset + PAGE_SIZE as u64 > self.size.load(Ordering::Acquire) {
            return Err(StorageError::PageNotFound(page_id));
        }
        Ok(offset)
    }
}

impl PageStore for PageStoreImpl {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let offset = self.check_access(page_id, buf.len())?;
        match &self.backing {
            Backing::File(file) => file.read_exact_at(buf, offset)?,
            // SAFETY: check_access proved the page lies below the committed size.
            Backing::Anonymous(region) => unsafe { region.read(offset as usize, buf) },
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        trace!(page = %page_id, "read page");
        Ok(())
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        let offset = self.check_access(page_id, data.len())?;
        match &self.backing {
            Backing::File(file) => {
                file.write_all_at(data, offset)?;
                if self.sync_on_write {
                    file.sync_data()?;
                }
            }
            // SAFETY: check_access proved the page lies below the committed size.
            Backing::Anonymous(region) => unsafe { region.write(offset as usize, data) },
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        trace!(page = %page_id, "wrote page");
        Ok(())
    }

    fn grow(&self, additional_pages: u32) -> Result<u32> {
        let _grow = self.grow_lock.lock();
        let current = self.size.load(Ordering::Acquire);
        let new_size = current + additional_pages as u64 * PAGE_SIZE as u64;
        let new_pages = new_size / PAGE_SIZE as u64;
        if new_pages >= u32::MAX as u64 {
            return Err(StorageError::OutOfSpace);
        }

        match &self.backing {
            Backing::File(file) => file.set_len(new_size)?,
            Backing::Anonymous(region) => {
                if new_size > region.reserved() as u64 {
                    return Err(StorageError::OutOfSpace);
                }
                region.commit(current as usize, new_size as usize)?;
            }
        }

        self.size.store(new_size, Ordering::Release);
        debug!(additional_pages, total_pages = new_pages, "grew page store");
        Ok(new_pages as u32)
    }

    fn sync(&self) -> Result<()> {
        if let Backing::File(file) = &self.backing {
            file.sync_all()?;
        }
        Ok(())
    }

    fn page_count(&self) -> u32 {
        (self.size.load(Ordering::Acquire) / PAGE_SIZE as u64) as u32
    }

    fn io_stats(&self) -> IoStats {
        IoStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use crate::test_util::small_anon;
    use tempfile::tempdir;

    #[test]
    fn test_create_file_store() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let store = PageStoreImpl::create(Some(&path), 4, StoreOptions::default())?;
        assert_eq!(store.page_count(), 4);
        assert!(!store.is_anonymous());
        assert_eq!(std::fs::metadata(&path)?.len(), 4 * PAGE_SIZE as u64);

        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = PageStoreImpl::create(Some(&path), 2, StoreOptions::default())?;

        let mut data = vec![0u8; PAGE_SIZE];
        data[0..5].copy_from_slice(b"hello");
        store.write_page(PageId::new(1), &data)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        store.read_page(PageId::new(1), &mut buf)?;
        assert_eq!(&buf[0..5], b"hello");
        assert_eq!(store.io_stats(), IoStats { reads: 1, writes: 1 });

        Ok(())
    }

    #[test]
    fn test_access_beyond_end_fails() -> Result<()> {
        let store = PageStoreImpl::create(None, 2, small_anon())?;
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            store.read_page(PageId::new(2), &mut buf),
            Err(StorageError::PageNotFound(_))
        ));
        assert!(store.write_page(PageId::new(7), &buf).is_err());
        assert!(store.read_page(PageId::new(0), &mut buf[..10]).is_err());
        Ok(())
    }

    #[test]
    fn test_reopen_file_store() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = PageStoreImpl::create(Some(&path), 3, StoreOptions::default())?;
            let mut data = vec![0u8; PAGE_SIZE];
            data[0..4].copy_from_slice(b"test");
            store.write_page(PageId::new(2), &data)?;
            store.close()?;
        }

        {
            let store = PageStoreImpl::open(&path, StoreOptions::default())?;
            assert_eq!(store.page_count(), 3);
            let mut buf = vec![0u8; PAGE_SIZE];
            store.read_page(PageId::new(2), &mut buf)?;
            assert_eq!(&buf[0..4], b"test");
        }

        Ok(())
    }

    #[test]
    fn test_open_rejects_partial_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 1]).unwrap();
        assert!(matches!(
            PageStoreImpl::open(&path, StoreOptions::default()),
            Err(StorageError::InvalidDatabaseFile(_))
        ));
    }

    #[test]
    fn test_anonymous_grow_keeps_contents() -> Result<()> {
        let store = PageStoreImpl::create(None, 1, small_anon())?;
        let mut data = vec![7u8; PAGE_SIZE];
        store.write_page(PageId::new(0), &data)?;

        assert_eq!(store.grow(3)?, 4);
        store.write_page(PageId::new(3), &data)?;

        data.fill(0);
        store.read_page(PageId::new(0), &mut data)?;
        assert!(data.iter().all(|&b| b == 7));
        store.read_page(PageId::new(2), &mut data)?;
        assert!(data.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_anonymous_grow_past_reservation() -> Result<()> {
        let options = StoreOptions {
            sync_on_write: false,
            anon_reserve_bytes: 8 * PAGE_SIZE as u64,
        };
        let store = PageStoreImpl::create(None, 6, options)?;
        assert!(matches!(store.grow(4), Err(StorageError::OutOfSpace)));
        assert_eq!(store.page_count(), 6);
        assert_eq!(store.grow(2)?, 8);
        Ok(())
    }

    #[test]
    fn test_concurrent_grow_is_serialized() -> Result<()> {
        let store = Arc::new(PageStoreImpl::create(None, 0, small_anon())?);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..16 {
                        store.grow(1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.page_count(), 128);
        Ok(())
    }
}
