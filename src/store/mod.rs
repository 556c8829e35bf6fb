//! Persistent tile store boundary
//!
//! A narrow key-to-blob contract consumed by the loader: safe for
//! concurrent reads; the loader's deduplication guarantees no two
//! concurrent writers for one key.

pub mod disk;
pub mod memory;

pub use disk::FileTileStore;
pub use memory::MemoryTileStore;

use crate::core::types::{BoxFuture, Result};

/// Key-to-blob store for downloaded tile files
pub trait TileStore: Send + Sync + 'static {
    /// Fetch a blob. Absent keys are `Ok(None)`, not errors.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// Write a blob, replacing any previous value
    fn put<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Drop every stored blob
    fn clear(&self) -> BoxFuture<'_, Result<()>>;
}
