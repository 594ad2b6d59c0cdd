//! Interfaces shared by the layered and undo-log engines.

use crate::error::Result;
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle};
use crate::types::{Cursor, EngineStats, Epoch};

/// Mapping contract of a single store.
pub trait KeyValueStore {
    fn name(&self) -> &str;

    /// `Ok(None)` when the key is absent through the whole chain.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Live pairs in ascending key order.
    fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .iter()?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect())
    }

    /// Live keys in the merged view.
    fn len(&self) -> Result<usize> {
        Ok(self.iter()?.len())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Up to `limit` pairs with key `>= start`.
    fn range_from(&self, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .iter()?
            .into_iter()
            .filter(|(key, _)| key.as_slice() >= start)
            .take(limit)
            .collect())
    }
}

/// Epoch lifecycle across every registered store.
///
/// Exactly one writer drives `advance_all`, `revoke`, `merge`, `reset`,
/// `mark` and head writes. `solidify` may run on another thread but never
/// concurrently with itself. Every operation applies to all stores or none.
pub trait RevokingEngine: Send + Sync {
    type Store: KeyValueStore;

    /// Register a store, or return the existing handle.
    fn register_store(&self, name: &str) -> Result<Self::Store>;

    /// Handle of an already registered store.
    fn store(&self, name: &str) -> Result<Self::Store>;

    fn store_names(&self) -> Vec<String>;

    /// Open a new epoch on every store.
    fn advance_all(&self) -> Result<Epoch>;

    /// Discard the newest epoch on every store. Returns the discarded epoch.
    fn revoke(&self) -> Result<Epoch>;

    /// Fold the newest epoch into the one below it. Returns the surviving epoch.
    fn merge(&self) -> Result<Epoch>;

    /// Make the `count` oldest epochs irreversible. Returns how many were folded.
    fn solidify(&self, count: usize) -> Result<usize>;

    /// Solidify whatever exceeds the configured revocable depth.
    fn flush_if_needed(&self) -> Result<usize>;

    /// Drop every open epoch, returning to the last solidified state.
    fn reset(&self) -> Result<()>;

    /// Move a cursor marker forward to `epoch`.
    fn mark(&self, cursor: Cursor, epoch: Epoch) -> Result<()>;

    fn marker(&self, cursor: Cursor) -> Option<Epoch>;

    /// Read one key through a cursor.
    fn read(&self, cursor: Cursor, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Open epochs above the solidified state.
    fn depth(&self) -> usize;

    fn head_epoch(&self) -> Epoch;

    fn root_epoch(&self) -> Epoch;

    fn stats(&self) -> EngineStats;

    fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle;
}
