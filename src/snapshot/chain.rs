//! Per-store chains and the store handle.

use super::layer::Layer;
use super::manager::Shared;
use crate::engine::KeyValueStore;
use crate::error::{Result, StoreError};
use crate::types::{ChainStats, Cursor, Entry, Epoch, Hash};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Weak};

/// Layers of one store, from root to head, plus the cursor markers.
pub(crate) struct ChainState {
    pub(crate) name: String,
    pub(crate) root: Arc<Layer>,
    pub(crate) head: Arc<Layer>,
    pub(crate) solid: Option<Arc<Layer>>,
    pub(crate) pbft: Option<Arc<Layer>>,
}

impl ChainState {
    pub(crate) fn new(name: &str, root: Arc<Layer>) -> Self {
        Self {
            name: name.to_string(),
            head: Arc::clone(&root),
            root,
            solid: None,
            pbft: None,
        }
    }

    /// Layer a cursor reads from. An unset marker reads the root.
    pub(crate) fn cursor_layer(&self, cursor: Cursor) -> Arc<Layer> {
        let layer = match cursor {
            Cursor::Head => Some(&self.head),
            Cursor::Solid => self.solid.as_ref(),
            Cursor::Pbft => self.pbft.as_ref(),
        };
        Arc::clone(layer.unwrap_or(&self.root))
    }

    pub(crate) fn marker_mut(&mut self, cursor: Cursor) -> Option<&mut Option<Arc<Layer>>> {
        match cursor {
            Cursor::Head => None,
            Cursor::Solid => Some(&mut self.solid),
            Cursor::Pbft => Some(&mut self.pbft),
        }
    }

    /// Drop the oldest deltas after a fold. `roots[i]` is the root written for
    /// the `i`-th oldest delta; the last one becomes the chain's root.
    pub(crate) fn rebase(&mut self, roots: &[Arc<Layer>]) {
        let Some(root) = roots.last().cloned() else {
            return;
        };
        let deltas = self.deltas();
        if let Some(survivor) = deltas.get(roots.len()) {
            survivor.set_previous(Arc::clone(&root));
            root.set_next(Arc::downgrade(survivor));
        }
        for (layer, folded) in deltas.iter().zip(roots) {
            layer.fold_into(Arc::clone(folded));
        }

        let boundary = root.epoch();
        for slot in [&mut self.solid, &mut self.pbft] {
            if slot.as_ref().is_some_and(|layer| layer.epoch() <= boundary) {
                *slot = Some(Arc::clone(&root));
            }
        }
        self.root = root;
    }

    /// Delta layers, oldest first.
    pub(crate) fn deltas(&self) -> Vec<Arc<Layer>> {
        let mut layers = Vec::new();
        let mut current = Arc::clone(&self.head);
        while let Some(previous) = current.previous() {
            layers.push(current);
            current = previous;
        }
        layers.reverse();
        layers
    }

    /// The layer at `epoch`, walking down from the head. Epochs at or below
    /// the root resolve to the root.
    pub(crate) fn find(&self, epoch: Epoch) -> Arc<Layer> {
        let mut current = Arc::clone(&self.head);
        while current.epoch() > epoch {
            match current.previous() {
                Some(previous) => current = previous,
                None => break,
            }
        }
        current
    }

    /// Push a new empty head.
    pub(crate) fn push(&mut self, head: Arc<Layer>) {
        self.head = head;
    }

    /// Drop the head. The new head forgets its `next`.
    pub(crate) fn pop(&mut self) -> Result<Arc<Layer>> {
        let previous = self.head.previous().ok_or_else(|| {
            StoreError::violation(format!("chain {} has no layer above its root", self.name))
        })?;
        previous.set_next(Weak::new());
        Ok(std::mem::replace(&mut self.head, previous))
    }

    pub(crate) fn stats(&self) -> ChainStats {
        let deltas = self.deltas();
        ChainStats {
            name: self.name.clone(),
            root_epoch: self.root.epoch(),
            head_epoch: self.head.epoch(),
            depth: deltas.len(),
            layer_entries: deltas.iter().map(|l| l.delta_len()).collect(),
            delta_bytes: deltas.iter().map(|l| l.delta_bytes()).sum(),
        }
    }
}

/// Handle to one registered store of a [`super::SnapshotManager`].
///
/// Reads go through the live head unless a cursor is given. Writes always
/// target the head and are serialized with the manager's writer.
#[derive(Clone)]
pub struct Chain {
    name: String,
    shared: Arc<Shared>,
}

impl Chain {
    pub(crate) fn new(name: &str, shared: Arc<Shared>) -> Self {
        Self {
            name: name.to_string(),
            shared,
        }
    }

    /// Capture the layer a cursor designates. Reads through it stay on that
    /// version regardless of later writer progress.
    pub fn at(&self, cursor: Cursor) -> Result<Arc<Layer>> {
        self.shared.layer(cursor, &self.name)
    }

    pub fn get_at(&self, cursor: Cursor, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.at(cursor)?.get(key)
    }

    pub fn iter_at(&self, cursor: Cursor) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.at(cursor)?.iter()
    }

    /// Decode a value written with [`Chain::put_encoded`].
    pub fn get_decoded<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode with MessagePack and write to the head.
    pub fn put_encoded<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec(value)?;
        self.put(key, &bytes)
    }

    /// SHA-256 over the merged view at a cursor.
    pub fn digest(&self, cursor: Cursor) -> Result<Hash> {
        let pairs = self.iter_at(cursor)?;
        Ok(Hash::of_pairs(
            pairs.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        ))
    }

    pub fn stats(&self) -> Result<ChainStats> {
        self.shared.chain_stats(&self.name)
    }
}

impl KeyValueStore for Chain {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(Cursor::Head, key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared
            .write_head(&self.name, key, Entry::Value(value.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.shared.write_head(&self.name, key, Entry::Tombstone)
    }

    fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.iter_at(Cursor::Head)
    }

    fn prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.at(Cursor::Head)?.prefix(prefix)
    }

    fn range_from(&self, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.at(Cursor::Head)?.range_from(start, limit)
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").field("name", &self.name).finish()
    }
}
