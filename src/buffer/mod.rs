//! Buffer pool: fixed set of in-memory frames over the page store.
//!
//! Frames are replaced with a clock sweep. Every frame carries its own latch;
//! the page-to-frame translation table sits behind a pool-wide latch that is
//! held shared for lookups and exclusively while a page is being swapped in.

mod clock;
mod frame;
mod pool;

pub use pool::{BufferPool, BufferPoolImpl, FrameGuard, PoolStats};
