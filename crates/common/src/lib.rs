//! Shared types for the disk-backed B+ tree: the error hierarchy, the
//! runtime configuration, and the small set of primitive types (offsets,
//! keys, values) every other crate in this workspace builds on.

#[cfg(test)]
mod tests;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A byte offset into the tree's data file. Every page lives at an offset
/// that is a multiple of the configured block size.
pub type Offset = u64;

/// Sentinel offset meaning "no such page": an absent parent, an absent
/// sibling, the root of an empty tree, and the terminator of the boot
/// record's free-block list.
pub const INVALID: Offset = 0xdead_beef;

/// The fixed-width integer key type this tree indexes.
pub type Key = u32;

/// The fixed-width integer value type this tree stores.
pub type Val = u64;

/// Canonical error type shared across the storage, buffer, and btree
/// crates.
#[derive(Error, Debug)]
pub enum BpError {
    #[error("config invalid: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("cache exhausted: all resident pages are pinned")]
    CacheExhausted,
    #[error("duplicate key")]
    Duplicate,
    #[error("not found")]
    NotFound,
    #[error("corrupt on-disk structure: {0}")]
    Corrupt(String),
}

/// Result alias that carries a [`BpError`].
pub type BpResult<T> = Result<T, BpError>;

/// Runtime configuration for opening a tree store.
///
/// # Example
/// ```
/// use common::Config;
///
/// let config = Config::builder()
///     .file_name("my_tree.db")
///     .block_size(4096)
///     .cache_size(512)
///     .build();
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct Config {
    /// Path (without the `.boot` suffix) of the tree's data file.
    #[builder(into)]
    pub file_name: PathBuf,
    /// Page size in bytes; must divide the OS page size and the
    /// filesystem block size of `file_name`'s directory.
    #[builder(default = 4096)]
    pub block_size: usize,
    /// Maximum number of resident pages in the in-memory cache.
    #[builder(default = 256)]
    pub cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_name: PathBuf::from("btree_store"),
            block_size: 4096,
            cache_size: 256,
        }
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{BpError, BpResult, Config, Key, Offset, Val, INVALID};
}
