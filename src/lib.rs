//! # Page Engine
//!
//! The storage core of an embedded database: durable fixed-size pages, a
//! latch-protected buffer pool, a bitmap page allocator and a slotted-page
//! record store.
//!
//! ## Architecture
//!
//! The engine is composed of layered components, each usable on its own:
//!
//! - **Storage Layer** (`storage`): page I/O over a file or an anonymous
//!   memory reservation
//! - **Latches** (`latch`): shared / shared-exclusive / exclusive latches
//!   with SX-to-exclusive upgrade
//! - **Buffer Pool** (`buffer`): clock-sweep page cache with per-frame latches
//! - **Allocator** (`alloc`): bitmap page allocator with checksummed metadata
//! - **Page Layer** (`page`): slotted data pages and chain pages
//! - **Catalog** (`catalog`): record store returning `VPtr`s
//!
//! ## Usage
//!
//! ```rust,ignore
//! use page_engine::{Config, Engine};
//!
//! let engine = Engine::create(Config::new("my_database.db"))?;
//!
//! let vptr = engine.write(b"hello world", false)?;
//! assert_eq!(engine.read(&vptr)?, b"hello world");
//! engine.free(&vptr)?;
//!
//! engine.close()?;
//! ```

pub mod alloc;
pub mod buffer;
pub mod catalog;
pub mod error;
pub mod latch;
pub mod page;
pub mod storage;
pub mod types;

pub use error::{Result, StorageError};
pub use types::{PageId, PAGE_SIZE};

// Re-export main public API
pub use alloc::{AllocStats, PageAllocator};
pub use buffer::{BufferPool, BufferPoolImpl, FrameGuard, PoolStats};
pub use catalog::{Catalog, CatalogStats, VPtr, NORMAL_DATA_LIMIT};
pub use latch::{Latch, LatchMode, Latched};
pub use storage::{IoStats, PageStore, PageStoreImpl, StoreOptions};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use types::{ANON_RESERVE_BYTES, DEFAULT_POOL_SIZE, MIN_POOL_SIZE};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the database file; `None` keeps everything in anonymous memory
    pub path: Option<PathBuf>,
    /// Buffer pool size in frames (default: 1024, minimum: 8)
    pub buffer_pool_size: usize,
    /// Whether to sync every page write (default: false for performance)
    pub sync_on_write: bool,
    /// Address space reserved for the anonymous backing (default: 4 TiB)
    pub anon_reserve_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            buffer_pool_size: DEFAULT_POOL_SIZE,
            sync_on_write: false,
            anon_reserve_bytes: ANON_RESERVE_BYTES,
        }
    }
}

impl Config {
    /// Create a file-backed configuration with default settings
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Create a configuration for an anonymous, memory-only store
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set buffer pool size
    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = size;
        self
    }

    /// Enable sync on write for durability
    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    /// Set the anonymous reservation size
    pub fn anon_reserve_bytes(mut self, bytes: u64) -> Self {
        self.anon_reserve_bytes = bytes;
        self
    }

    fn store_options(&self) -> StoreOptions {
        StoreOptions {
            sync_on_write: self.sync_on_write,
            anon_reserve_bytes: self.anon_reserve_bytes,
        }
    }

    fn pool_frames(&self) -> usize {
        if self.buffer_pool_size < MIN_POOL_SIZE {
            warn!(
                requested = self.buffer_pool_size,
                minimum = MIN_POOL_SIZE,
                "buffer pool size raised to the minimum"
            );
        }
        self.buffer_pool_size.max(MIN_POOL_SIZE)
    }
}

/// Engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Pages covered by the allocator
    pub total_pages: u32,
    /// Allocator groups
    pub total_groups: u32,
    /// Pages free across all groups
    pub free_pages: u64,
    /// Buffer pool counters
    pub pool: PoolStats,
    /// Store page transfers
    pub io: IoStats,
}

/// Main engine handle wiring store, pool, allocator and catalog together
///
/// This is the surface other database layers (indexes, schema, record
/// encoding) build on: payload storage through `write`/`read`/`free`, raw
/// pages through `alloc_page`/`free_page` and `pool()`.
pub struct Engine {
    store: Arc<PageStoreImpl>,
    pool: Arc<dyn BufferPool>,
    alloc: Arc<PageAllocator>,
    catalog: Catalog,
    config: Config,
}

impl Engine {
    /// Create a fresh engine, truncating any existing file
    pub fn create(config: Config) -> Result<Self> {
        let store = Arc::new(PageStoreImpl::create(
            config.path.as_deref(),
            0,
            config.store_options(),
        )?);
        let pool = Arc::new(BufferPoolImpl::new(store.clone(), config.pool_frames()));
        let alloc = Arc::new(PageAllocator::create(store.clone(), pool.clone())?);
        let catalog = Catalog::create(pool.clone(), alloc.clone())?;

        let engine = Self {
            store,
            pool,
            alloc,
            catalog,
            config,
        };
        engine.flush()?;
        info!(path = ?engine.config.path, "engine created");
        Ok(engine)
    }

    /// Open an existing file-backed engine, verifying its metadata
    pub fn open(config: Config) -> Result<Self> {
        let Some(path) = config.path.as_deref() else {
            return Err(StorageError::invalid_operation(
                "an anonymous store cannot be reopened",
            ));
        };
        let store = Arc::new(PageStoreImpl::open(path, config.store_options())?);
        let pool = Arc::new(BufferPoolImpl::new(store.clone(), config.pool_frames()));
        let alloc = Arc::new(PageAllocator::open(store.clone(), pool.clone())?);
        let catalog = Catalog::open(pool.clone(), alloc.clone())?;

        info!(path = %path.display(), total_pages = alloc.total_pages(), "engine opened");
        Ok(Self {
            store,
            pool,
            alloc,
            catalog,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Store a payload; `is_key` selects the key space over the value space
    pub fn write(&self, data: &[u8], is_key: bool) -> Result<VPtr> {
        self.catalog.write(data, is_key)
    }

    pub fn read(&self, vptr: &VPtr) -> Result<Vec<u8>> {
        self.catalog.read(vptr)
    }

    pub fn free(&self, vptr: &VPtr) -> Result<()> {
        self.catalog.free(vptr)
    }

    /// Allocate a raw page near `hint`
    pub fn alloc_page(&self, hint: Option<PageId>) -> Result<PageId> {
        self.alloc.alloc(hint)
    }

    pub fn free_page(&self, page: PageId) -> Result<()> {
        self.alloc.free(page)
    }

    /// Raw frame access: `fetch`, `unpin`, `flush`
    pub fn pool(&self) -> &dyn BufferPool {
        self.pool.as_ref()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn allocator(&self) -> &PageAllocator {
        &self.alloc
    }

    /// Write back dirty pages and allocator metadata, then sync
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all()?;
        self.alloc.persist()?;
        self.store.sync()
    }

    /// Flush and close the store
    pub fn close(self) -> Result<()> {
        self.flush()?;
        let Engine {
            store,
            pool,
            alloc,
            catalog,
            ..
        } = self;
        drop(catalog);
        drop(alloc);
        drop(pool);
        match Arc::try_unwrap(store) {
            Ok(store) => store.close(),
            Err(store) => store.sync(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let alloc = self.alloc.stats();
        EngineStats {
            total_pages: alloc.total_pages,
            total_groups: alloc.total_groups,
            free_pages: alloc.free_pages,
            pool: self.pool.stats(),
            io: self.store.io_stats(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn anon() -> Config {
        Config::anonymous()
            .anon_reserve_bytes(1 << 30)
            .buffer_pool_size(64)
    }

    #[test]
    fn test_basic_operations() -> Result<()> {
        let engine = Engine::create(anon())?;

        let small = engine.write(b"value1", false)?;
        let key = engine.write(b"key1", true)?;
        let big = engine.write(&vec![7u8; 10_000], false)?;

        assert_eq!(engine.read(&small)?, b"value1");
        assert_eq!(engine.read(&key)?, b"key1");
        assert_eq!(engine.read(&big)?, vec![7u8; 10_000]);

        engine.free(&big)?;
        engine.free(&small)?;
        assert_eq!(engine.read(&key)?, b"key1");
        Ok(())
    }

    #[test]
    fn test_churn_end_to_end() -> Result<()> {
        let engine = Engine::create(anon())?;
        let mut rng = StdRng::seed_from_u64(2024);

        let originals: Vec<(VPtr, Vec<u8>)> = (0..200)
            .map(|i| {
                let data = format!("item-{i}-{}", "x".repeat(rng.gen_range(100..300))).into_bytes();
                engine.write(&data, false).map(|vptr| (vptr, data))
            })
            .collect::<Result<_>>()?;

        for (i, (vptr, _)) in originals.iter().enumerate() {
            if i % 2 == 0 {
                engine.free(vptr)?;
            }
        }

        let fresh: Vec<(VPtr, Vec<u8>)> = (0..100)
            .map(|i| {
                let data = format!("new-{i}").into_bytes();
                engine.write(&data, false).map(|vptr| (vptr, data))
            })
            .collect::<Result<_>>()?;

        for (i, (vptr, data)) in originals.iter().enumerate() {
            if i % 2 == 1 {
                assert_eq!(&engine.read(vptr)?, data);
            }
        }
        for (vptr, data) in &fresh {
            assert_eq!(&engine.read(vptr)?, data);
        }
        Ok(())
    }

    #[test]
    fn test_reopen_file_engine() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let (small, big, page) = {
            let engine = Engine::create(Config::new(&path).buffer_pool_size(16))?;
            let small = engine.write(b"survives reopen", false)?;
            let big = engine.write(&vec![3u8; 9000], true)?;
            let page = engine.alloc_page(None)?;
            {
                let mut frame = engine.pool().fetch(page, LatchMode::Exclusive)?;
                frame.data_mut()?[..4].copy_from_slice(b"raw!");
            }
            engine.catalog().set_schema_root(page)?;
            engine.close()?;
            (small, big, page)
        };

        let engine = Engine::open(Config::new(&path).buffer_pool_size(16))?;
        assert_eq!(engine.read(&small)?, b"survives reopen");
        assert_eq!(engine.read(&big)?, vec![3u8; 9000]);
        assert_eq!(engine.catalog().schema_root()?, page);
        assert!(engine.allocator().is_allocated(page)?);
        {
            let frame = engine.pool().fetch(page, LatchMode::Shared)?;
            assert_eq!(&frame.data()[..4], b"raw!");
        }

        // New allocations never hand out pages that are in use
        let next = engine.alloc_page(Some(page))?;
        assert_ne!(next, page);
        Ok(())
    }

    #[test]
    fn test_open_rejects_garbage() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0xA5u8; PAGE_SIZE * 4])?;
        assert!(matches!(
            Engine::open(Config::new(&path)),
            Err(StorageError::InvalidDatabaseFile(_))
        ));
        assert!(Engine::open(Config::anonymous()).is_err());
        Ok(())
    }

    #[test]
    fn test_raw_pages() -> Result<()> {
        let engine = Engine::create(anon())?;
        let before = engine.stats().free_pages;
        let page = engine.alloc_page(None)?;
        assert_eq!(engine.stats().free_pages, before - 1);

        let pinned = engine.pool().fetch(page, LatchMode::Shared)?.unlatch();
        assert_eq!(engine.pool().pin_count(pinned), Some(1));
        engine.pool().unpin(pinned, false)?;

        engine.free_page(page)?;
        assert_eq!(engine.stats().free_pages, before);
        Ok(())
    }

    #[test]
    fn test_config_from_json() -> Result<()> {
        let config = Config::from_json(r#"{"path": "/tmp/x.db", "buffer_pool_size": 64}"#)?;
        assert_eq!(config.path, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(config.buffer_pool_size, 64);
        assert!(!config.sync_on_write);
        assert_eq!(config.anon_reserve_bytes, ANON_RESERVE_BYTES);

        assert_eq!(Config::from_json("{}")?, Config::default());
        assert!(matches!(
            Config::from_json("{\"buffer_pool_size\": \"big\"}"),
            Err(StorageError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_tiny_pool_is_raised_to_minimum() -> Result<()> {
        let engine = Engine::create(anon().buffer_pool_size(1))?;
        assert_eq!(engine.stats().pool.capacity, MIN_POOL_SIZE);
        let vptr = engine.write(&vec![1u8; 20_000], false)?;
        assert_eq!(engine.read(&vptr)?.len(), 20_000);
        Ok(())
    }

    #[test]
    fn test_stats_serialize() -> Result<()> {
        let engine = Engine::create(anon())?;
        engine.write(b"abc", false)?;
        let json = serde_json::to_value(engine.stats())?;
        assert_eq!(json["total_groups"], 1);
        assert!(json["pool"]["misses"].as_u64().unwrap_or(0) > 0);
        Ok(())
    }
}
