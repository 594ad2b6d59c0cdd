//! Durable backing stores for chain roots.
//!
//! A root layer reads and writes through a [`BackingStore`]. Only the root
//! touches it, and in the layered engine only `solidify` writes to it once a
//! chain has open epochs.

mod file;
mod memory;

pub use file::{FileBacking, FileProvider};
pub use memory::{MemoryBacking, MemoryProvider};

use crate::error::Result;
use crate::types::Entry;
use std::sync::Arc;

/// Key/value store underneath a chain root.
///
/// Implementations must be safe for concurrent readers while a single writer
/// applies batches. A batch is applied in order, so a later entry for the
/// same key wins.
pub trait BackingStore: Send + Sync {
    /// Name of the logical store this backing serves.
    fn name(&self) -> &str;

    /// Read a value. `Ok(None)` if absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(&[(key.to_vec(), Entry::Value(value.to_vec()))])
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_batch(&[(key.to_vec(), Entry::Tombstone)])
    }

    /// Apply puts and tombstones as one unit.
    fn write_batch(&self, batch: &[(Vec<u8>, Entry)]) -> Result<()>;

    /// All live pairs in ascending key order.
    fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Number of live keys.
    fn size(&self) -> Result<u64>;

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Make previous writes durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens the backing for a named store.
pub trait BackingProvider: Send + Sync {
    fn open(&self, name: &str) -> Result<Arc<dyn BackingStore>>;
}
