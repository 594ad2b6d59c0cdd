//! Snapshot layers.

use crate::backing::BackingStore;
use crate::error::Result;
use crate::types::{Entry, Epoch};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// One version of a store: either a root over durable storage or an
/// in-memory delta.
///
/// `previous` links own the layer below; `next` links are weak, so a layer
/// discarded by the writer is freed even if an older layer still names it.
///
/// A root always shows the state at its own epoch. When a fold moves the
/// backing past it, the root is retired: it keeps the prior value of every key
/// the fold wrote and defers everything else to the root that replaced it.
pub struct Layer {
    epoch: Epoch,
    kind: LayerKind,
    next: Mutex<Weak<Layer>>,
}

enum LayerKind {
    Root {
        backing: Arc<dyn BackingStore>,
        retired: RwLock<Option<Retired>>,
    },
    Delta(RwLock<Delta>),
}

struct Delta {
    previous: Arc<Layer>,
    entries: BTreeMap<Vec<u8>, Entry>,
    /// Folded; `previous` is the root at this layer's epoch, so lookups skip
    /// straight past it.
    optimized: bool,
}

/// State of a root the backing has moved past.
struct Retired {
    undo: BTreeMap<Vec<u8>, Entry>,
    newer: Arc<Layer>,
}

/// One lookup step.
enum Step {
    Done(Option<Vec<u8>>),
    Defer(Arc<Layer>),
}

impl Layer {
    /// Create a root layer over a backing store.
    pub fn root(backing: Arc<dyn BackingStore>, epoch: Epoch) -> Arc<Layer> {
        Arc::new(Layer {
            epoch,
            kind: LayerKind::Root {
                backing,
                retired: RwLock::new(None),
            },
            next: Mutex::new(Weak::new()),
        })
    }

    /// Open an empty delta on top of this layer and link it as `next`.
    pub fn advance(self: &Arc<Self>) -> Arc<Layer> {
        let layer = Arc::new(Layer {
            epoch: self.epoch.next(),
            kind: LayerKind::Delta(RwLock::new(Delta {
                previous: Arc::clone(self),
                entries: BTreeMap::new(),
                optimized: false,
            })),
            next: Mutex::new(Weak::new()),
        });
        *self.next.lock() = Arc::downgrade(&layer);
        layer
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, LayerKind::Root { .. })
    }

    pub fn is_optimized(&self) -> bool {
        match &self.kind {
            LayerKind::Root { .. } => false,
            LayerKind::Delta(delta) => delta.read().optimized,
        }
    }

    /// True for a root that a later fold has replaced.
    pub fn is_retired(&self) -> bool {
        match &self.kind {
            LayerKind::Root { retired, .. } => retired.read().is_some(),
            LayerKind::Delta(_) => false,
        }
    }

    pub fn previous(&self) -> Option<Arc<Layer>> {
        match &self.kind {
            LayerKind::Root { .. } => None,
            LayerKind::Delta(delta) => Some(Arc::clone(&delta.read().previous)),
        }
    }

    /// The layer built on this one, if it is still alive.
    pub fn next(&self) -> Option<Arc<Layer>> {
        self.next.lock().upgrade()
    }

    /// Backing store, for root layers.
    pub fn backing(&self) -> Option<&Arc<dyn BackingStore>> {
        match &self.kind {
            LayerKind::Root { backing, .. } => Some(backing),
            LayerKind::Delta(_) => None,
        }
    }

    /// Merged lookup from this layer toward the root.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut step = self.step(key)?;
        loop {
            match step {
                Step::Done(value) => return Ok(value),
                Step::Defer(layer) => step = layer.step(key)?,
            }
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn step(&self, key: &[u8]) -> Result<Step> {
        match &self.kind {
            LayerKind::Root { backing, retired } => {
                if let Some(retired) = &*retired.read() {
                    return Ok(match retired.undo.get(key) {
                        Some(entry) => Step::Done(entry.value().map(<[u8]>::to_vec)),
                        None => Step::Defer(Arc::clone(&retired.newer)),
                    });
                }
                Ok(Step::Done(backing.get(key)?))
            }
            LayerKind::Delta(delta) => {
                let delta = delta.read();
                if !delta.optimized {
                    if let Some(entry) = delta.entries.get(key) {
                        return Ok(Step::Done(entry.value().map(<[u8]>::to_vec)));
                    }
                }
                Ok(Step::Defer(Arc::clone(&delta.previous)))
            }
        }
    }

    /// The decision this layer alone holds for `key`. Always `None` on a root.
    pub fn local(&self, key: &[u8]) -> Option<Entry> {
        match &self.kind {
            LayerKind::Root { .. } => None,
            LayerKind::Delta(delta) => delta.read().entries.get(key).cloned(),
        }
    }

    /// Record a value. On a root this writes the backing store.
    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.record(key, Entry::Value(value.to_vec()))
    }

    /// Record a tombstone. On a root this deletes from the backing store.
    pub(crate) fn delete(&self, key: &[u8]) -> Result<()> {
        self.record(key, Entry::Tombstone)
    }

    pub(crate) fn record(&self, key: &[u8], entry: Entry) -> Result<()> {
        match &self.kind {
            LayerKind::Root { backing, retired } => {
                // A direct write is the new state of this root.
                if let Some(retired) = &mut *retired.write() {
                    retired.undo.remove(key);
                }
                match entry {
                    Entry::Value(value) => backing.put(key, &value),
                    Entry::Tombstone => backing.delete(key),
                }
            }
            LayerKind::Delta(delta) => {
                delta.write().entries.insert(key.to_vec(), entry);
                Ok(())
            }
        }
    }

    /// Merged view from this layer: first decision per key wins, tombstones
    /// hide everything below them. Keys come back in ascending order.
    pub fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut decisions: BTreeMap<Vec<u8>, Entry> = BTreeMap::new();
        let mut below = self.collect_into(&mut decisions)?;
        while let Some(layer) = below {
            below = layer.collect_into(&mut decisions)?;
        }
        Ok(decisions
            .into_iter()
            .filter_map(|(key, entry)| entry.into_value().map(|value| (key, value)))
            .collect())
    }

    fn collect_into(&self, decisions: &mut BTreeMap<Vec<u8>, Entry>) -> Result<Option<Arc<Layer>>> {
        match &self.kind {
            LayerKind::Root { backing, retired } => {
                if let Some(retired) = &*retired.read() {
                    for (key, entry) in &retired.undo {
                        decisions.entry(key.clone()).or_insert_with(|| entry.clone());
                    }
                    return Ok(Some(Arc::clone(&retired.newer)));
                }
                for (key, value) in backing.iter()? {
                    decisions.entry(key).or_insert(Entry::Value(value));
                }
                Ok(None)
            }
            LayerKind::Delta(delta) => {
                let delta = delta.read();
                if !delta.optimized {
                    for (key, entry) in &delta.entries {
                        if !decisions.contains_key(key) {
                            decisions.insert(key.clone(), entry.clone());
                        }
                    }
                }
                Ok(Some(Arc::clone(&delta.previous)))
            }
        }
    }

    /// Merged pairs whose key starts with `prefix`.
    pub fn prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .iter()?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect())
    }

    /// Number of live keys in the merged view.
    pub fn len(&self) -> Result<usize> {
        Ok(self.iter()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Up to `limit` merged pairs with key `>= start`.
    pub fn range_from(&self, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .iter()?
            .into_iter()
            .filter(|(key, _)| key.as_slice() >= start)
            .take(limit)
            .collect())
    }

    /// Snapshot of this layer's own decisions, in key order.
    pub fn delta_entries(&self) -> Vec<(Vec<u8>, Entry)> {
        match &self.kind {
            LayerKind::Root { .. } => Vec::new(),
            LayerKind::Delta(delta) => delta
                .read()
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect(),
        }
    }

    /// Number of decisions held by this layer.
    pub fn delta_len(&self) -> usize {
        match &self.kind {
            LayerKind::Root { .. } => 0,
            LayerKind::Delta(delta) => delta.read().entries.len(),
        }
    }

    /// Approximate bytes held by this layer's decisions.
    pub fn delta_bytes(&self) -> usize {
        match &self.kind {
            LayerKind::Root { .. } => 0,
            LayerKind::Delta(delta) => delta
                .read()
                .entries
                .iter()
                .map(|(k, e)| k.len() + e.size())
                .sum(),
        }
    }

    // --- Chain surgery (manager only) ---

    pub(crate) fn set_previous(&self, previous: Arc<Layer>) {
        if let LayerKind::Delta(delta) = &self.kind {
            delta.write().previous = previous;
        }
    }

    pub(crate) fn set_next(&self, next: Weak<Layer>) {
        *self.next.lock() = next;
    }

    /// Fold `entries` (from the layer above) into this delta; theirs win.
    pub(crate) fn absorb(&self, entries: Vec<(Vec<u8>, Entry)>) {
        if let LayerKind::Delta(delta) = &self.kind {
            let mut delta = delta.write();
            for (key, entry) in entries {
                delta.entries.insert(key, entry);
            }
        }
    }

    /// Freeze a root before its backing is overwritten. `undo` holds the
    /// value each written key had at this root's epoch; `newer` reads the
    /// backing from now on. Retiring twice keeps the first recorded priors.
    pub(crate) fn retire(&self, undo: BTreeMap<Vec<u8>, Entry>, newer: Arc<Layer>) {
        if let LayerKind::Root { retired, .. } = &self.kind {
            let mut retired = retired.write();
            match &mut *retired {
                Some(current) => {
                    for (key, entry) in undo {
                        current.undo.entry(key).or_insert(entry);
                    }
                    current.newer = newer;
                }
                None => *retired = Some(Retired { undo, newer }),
            }
        }
    }

    /// Undo `retire` once the backing holds this root's state again.
    pub(crate) fn reinstate(&self) {
        if let LayerKind::Root { retired, .. } = &self.kind {
            *retired.write() = None;
        }
    }

    /// Release a folded delta. `root` must show exactly this layer's state.
    pub(crate) fn fold_into(&self, root: Arc<Layer>) {
        if let LayerKind::Delta(delta) = &self.kind {
            let mut delta = delta.write();
            delta.previous = root;
            delta.optimized = true;
            delta.entries = BTreeMap::new();
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LayerKind::Root { backing, retired } => write!(
                f,
                "Root({}, {:?}, retired={})",
                backing.name(),
                self.epoch(),
                retired.read().is_some()
            ),
            LayerKind::Delta(delta) => {
                let delta = delta.read();
                write!(
                    f,
                    "Delta({:?}, entries={}, optimized={})",
                    self.epoch(),
                    delta.entries.len(),
                    delta.optimized
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemoryBacking;

    fn root_with(pairs: &[(&str, &str)]) -> Arc<Layer> {
        let backing = MemoryBacking::with_data(
            "test",
            pairs
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec())),
        );
        Layer::root(Arc::new(backing), Epoch(0))
    }

    #[test]
    fn test_delta_defers_to_previous() {
        let root = root_with(&[("a", "1")]);
        let delta = root.advance();

        assert_eq!(delta.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(delta.epoch(), Epoch(1));
        assert!(!delta.is_root());
    }

    #[test]
    fn test_tombstone_hides_ancestor() {
        let root = root_with(&[]);
        let first = root.advance();
        first.put(b"k", b"x").unwrap();
        let second = first.advance();
        second.delete(b"k").unwrap();

        assert_eq!(second.get(b"k").unwrap(), None);
        assert_eq!(first.get(b"k").unwrap(), Some(b"x".to_vec()));
        assert_eq!(second.local(b"k"), Some(Entry::Tombstone));
        assert_eq!(second.local(b"other"), None);
    }

    #[test]
    fn test_iteration_keeps_head_most_decision() {
        let root = root_with(&[("a", "root"), ("b", "root"), ("c", "root")]);
        let first = root.advance();
        first.put(b"a", b"first").unwrap();
        first.delete(b"b").unwrap();
        let second = first.advance();
        second.put(b"b", b"second").unwrap();
        second.delete(b"c").unwrap();
        second.put(b"d", b"second").unwrap();

        let view = second.iter().unwrap();
        assert_eq!(
            view,
            vec![
                (b"a".to_vec(), b"first".to_vec()),
                (b"b".to_vec(), b"second".to_vec()),
                (b"d".to_vec(), b"second".to_vec()),
            ]
        );
    }

    #[test]
    fn test_next_is_weak() {
        let root = root_with(&[]);
        let delta = root.advance();
        assert_eq!(root.next().unwrap().epoch(), Epoch(1));

        drop(delta);
        assert!(root.next().is_none());
    }

    #[test]
    fn test_optimized_layer_is_bypassed() {
        let root = root_with(&[("k", "root")]);
        let delta = root.advance();
        delta.put(b"k", b"delta").unwrap();

        // As a fold would: retire the old root, write the backing, then
        // release the delta onto the new root.
        let backing = Arc::clone(root.backing().unwrap());
        let newer = Layer::root(Arc::clone(&backing), Epoch(1));
        let undo = BTreeMap::from([(b"k".to_vec(), Entry::Value(b"root".to_vec()))]);
        root.retire(undo, Arc::clone(&newer));
        backing.put(b"k", b"delta").unwrap();
        delta.fold_into(Arc::clone(&newer));

        assert!(delta.is_optimized());
        assert_eq!(delta.delta_len(), 0);
        assert_eq!(delta.get(b"k").unwrap(), Some(b"delta".to_vec()));
        assert_eq!(root.get(b"k").unwrap(), Some(b"root".to_vec()));
    }

    #[test]
    fn test_retired_root_keeps_its_epoch_state() {
        let root = root_with(&[("a", "0"), ("b", "0")]);
        let backing = Arc::clone(root.backing().unwrap());

        let newer = Layer::root(Arc::clone(&backing), Epoch(1));
        let undo = BTreeMap::from([
            (b"a".to_vec(), Entry::Value(b"0".to_vec())),
            (b"c".to_vec(), Entry::Tombstone),
        ]);
        root.retire(undo, Arc::clone(&newer));
        backing.put(b"a", b"1").unwrap();
        backing.put(b"c", b"1").unwrap();

        assert!(root.is_retired());
        assert_eq!(root.get(b"a").unwrap(), Some(b"0".to_vec()));
        assert_eq!(root.get(b"c").unwrap(), None);
        assert_eq!(
            root.iter().unwrap(),
            vec![
                (b"a".to_vec(), b"0".to_vec()),
                (b"b".to_vec(), b"0".to_vec()),
            ]
        );
        assert_eq!(newer.get(b"a").unwrap(), Some(b"1".to_vec()));

        // Putting the old values back makes the root live again.
        backing.put(b"a", b"0").unwrap();
        backing.delete(b"c").unwrap();
        root.reinstate();
        assert!(!root.is_retired());
        assert_eq!(root.iter().unwrap().len(), 2);
    }

    #[test]
    fn test_range_and_prefix() {
        let root = root_with(&[("acc/1", "a"), ("acc/2", "b"), ("wit/1", "c")]);
        let delta = root.advance();
        delta.put(b"acc/3", b"d").unwrap();

        assert_eq!(delta.prefix(b"acc/").unwrap().len(), 3);
        let range = delta.range_from(b"acc/2", 2).unwrap();
        assert_eq!(range[0].0, b"acc/2".to_vec());
        assert_eq!(range[1].0, b"acc/3".to_vec());
    }
}
