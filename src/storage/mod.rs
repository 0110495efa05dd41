//! Storage layer: durable fixed-size page I/O.
//!
//! This module provides the page store, the lowest layer of the engine. It
//! reads, writes and grows a backing of whole pages, either a file or an
//! anonymous memory reservation.

mod anon;
mod page_store;

pub use page_store::{IoStats, PageStore, PageStoreImpl, StoreOptions};
