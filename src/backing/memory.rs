//! In-memory backing store.

use super::{BackingProvider, BackingStore};
use crate::error::Result;
use crate::types::Entry;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ordered in-memory map. Used for tests and for nodes that rebuild state.
pub struct MemoryBacking {
    name: String,
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBacking {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seeded with initial pairs.
    pub fn with_data<I>(name: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        Self {
            name: name.into(),
            data: RwLock::new(pairs.into_iter().collect()),
        }
    }
}

impl BackingStore for MemoryBacking {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn write_batch(&self, batch: &[(Vec<u8>, Entry)]) -> Result<()> {
        let mut data = self.data.write();
        for (key, entry) in batch {
            match entry {
                Entry::Value(value) => {
                    data.insert(key.clone(), value.clone());
                }
                Entry::Tombstone => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }

    fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }
}

/// Hands out a fresh [`MemoryBacking`] per store name.
#[derive(Clone, Debug, Default)]
pub struct MemoryProvider;

impl BackingProvider for MemoryProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn BackingStore>> {
        Ok(Arc::new(MemoryBacking::new(name)))
    }
}
