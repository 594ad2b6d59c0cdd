//! Multi-store read views.

use super::layer::Layer;
use crate::error::{Result, StoreError};
use crate::types::{Cursor, Epoch, Hash};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The layers a cursor designated on every store, captured under one lock.
///
/// Reads through a view are consistent across stores: an account balance and
/// the witness vote written in the same block are seen together or not at all.
#[derive(Clone, Debug)]
pub struct View {
    cursor: Cursor,
    epoch: Epoch,
    layers: BTreeMap<String, Arc<Layer>>,
}

impl View {
    pub(crate) fn new(cursor: Cursor, epoch: Epoch, layers: BTreeMap<String, Arc<Layer>>) -> Self {
        Self {
            cursor,
            epoch,
            layers,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Epoch the cursor designated at capture time.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn stores(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn layer(&self, store: &str) -> Result<&Arc<Layer>> {
        self.layers
            .get(store)
            .ok_or_else(|| StoreError::StoreNotRegistered(store.to_string()))
    }

    pub fn get(&self, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.layer(store)?.get(key)
    }

    pub fn iter(&self, store: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.layer(store)?.iter()
    }

    /// Digest over every store's merged view, in store-name order.
    pub fn digest(&self) -> Result<Hash> {
        let mut per_store = Vec::with_capacity(self.layers.len());
        for (name, layer) in &self.layers {
            let pairs = layer.iter()?;
            let hash = Hash::of_pairs(pairs.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
            per_store.push((name.as_bytes().to_vec(), hash.0.to_vec()));
        }
        Ok(Hash::of_pairs(
            per_store.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        ))
    }
}
