//! The page buffer pool and LRU page cache: the exclusive intermediary
//! between the B+ tree engine and the disk-backed data file.
//!
//! [`PageBufferPool`] owns the fixed-capacity, page-aligned backing
//! storage and the intrusive list that orders it by recency. [`PageCache`]
//! layers an offset→slot index, pin counts, and dirty tracking on top,
//! enforcing that a pinned page is never evicted.

mod aligned;
mod cache;
mod pool;

pub use cache::PageCache;
pub use pool::PageBufferPool;
