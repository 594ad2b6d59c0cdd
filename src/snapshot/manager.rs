//! Chain-set orchestration for the layered engine.

use super::chain::{Chain, ChainState};
use super::layer::Layer;
use super::view::View;
use crate::backing::{BackingProvider, BackingStore, FileProvider, MemoryProvider};
use crate::config::EngineConfig;
use crate::datadir::{DataDir, EngineKind};
use crate::engine::RevokingEngine;
use crate::error::{Result, StoreError};
use crate::subscriptions::{
    EngineEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle, SubscriptionManager,
};
use crate::types::{ChainStats, Cursor, EngineStats, Entry, Epoch};
use crate::wal::{StoreBatch, WalOperation, WriteAheadLog};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

const WAL_FILE: &str = "checkpoint.wal";

/// Every chain plus the epoch bookkeeping they share.
pub(crate) struct Chains {
    pub(crate) stores: BTreeMap<String, ChainState>,
    pub(crate) root_epoch: Epoch,
    /// Delta layers above the root, identical on every chain.
    pub(crate) depth: usize,
    pub(crate) solid: Option<Epoch>,
    pub(crate) pbft: Option<Epoch>,
    /// Oldest layers currently being written to the backings by `solidify`.
    pub(crate) pinned: usize,
}

impl Chains {
    pub(crate) fn head_epoch(&self) -> Epoch {
        Epoch(self.root_epoch.0 + self.depth as u64)
    }

    fn marker(&self, cursor: Cursor) -> Option<Epoch> {
        match cursor {
            Cursor::Head => None,
            Cursor::Solid => self.solid,
            Cursor::Pbft => self.pbft,
        }
    }

    fn markers(&self) -> impl Iterator<Item = (Cursor, Epoch)> {
        [(Cursor::Solid, self.solid), (Cursor::Pbft, self.pbft)]
            .into_iter()
            .filter_map(|(cursor, epoch)| epoch.map(|e| (cursor, e)))
    }

    /// The cursor whose marker sits at `epoch`, if any.
    fn marked_at(&self, epoch: Epoch) -> Option<Cursor> {
        self.markers()
            .find(|(_, marker)| *marker == epoch)
            .map(|(cursor, _)| cursor)
    }

    fn chain(&self, name: &str) -> Result<&ChainState> {
        self.stores
            .get(name)
            .ok_or_else(|| StoreError::StoreNotRegistered(name.to_string()))
    }
}

/// Layers one `solidify` call folds for one chain.
struct FoldChain {
    name: String,
    backing: Arc<dyn BackingStore>,
    root: Arc<Layer>,
    layers: Vec<Arc<Layer>>,
}

/// State shared by the manager and every [`Chain`] handle.
pub(crate) struct Shared {
    config: EngineConfig,
    provider: Box<dyn BackingProvider>,
    data_dir: Option<DataDir>,
    wal: Option<WriteAheadLog>,
    chains: RwLock<Chains>,
    /// Backings opened so far, including ones only touched by recovery.
    backings: Mutex<HashMap<String, Arc<dyn BackingStore>>>,
    write_lock: Mutex<()>,
    solidify_lock: Mutex<()>,
    events: SubscriptionManager,
}

impl Shared {
    pub(crate) fn layer(&self, cursor: Cursor, name: &str) -> Result<Arc<Layer>> {
        Ok(self.chains.read().chain(name)?.cursor_layer(cursor))
    }

    pub(crate) fn chain_stats(&self, name: &str) -> Result<ChainStats> {
        Ok(self.chains.read().chain(name)?.stats())
    }

    /// Record a decision in the head of one chain.
    pub(crate) fn write_head(&self, name: &str, key: &[u8], entry: Entry) -> Result<()> {
        let _writer = self.write_lock.lock();
        let head = {
            let chains = self.chains.read();
            let chain = chains.chain(name)?;
            if chains.depth > 0 {
                if let Some(cursor) = chains.marked_at(chains.head_epoch()) {
                    return Err(StoreError::violation(format!(
                        "write into head {} marked {}",
                        chains.head_epoch(),
                        cursor
                    )));
                }
            }
            Arc::clone(&chain.head)
        };
        head.record(key, entry)
    }

    fn backing_for(&self, name: &str) -> Result<Arc<dyn BackingStore>> {
        let mut backings = self.backings.lock();
        if let Some(backing) = backings.get(name) {
            return Ok(Arc::clone(backing));
        }
        let backing = self.provider.open(name)?;
        backings.insert(name.to_string(), Arc::clone(&backing));
        Ok(backing)
    }

    /// Replay folds that were logged but not confirmed before a crash.
    fn recover(&self) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        if !wal.has_pending()? {
            return Ok(());
        }

        let mut root_epoch = self.chains.read().root_epoch;
        let mut replayed = 0usize;
        for entry in wal.get_pending_entries()? {
            let Some(WalOperation::Fold { boundary, stores }) = entry.operation else {
                continue;
            };
            for batch in &stores {
                let backing = self.backing_for(&batch.store)?;
                backing.write_batch(&batch.entries)?;
                backing.flush()?;
            }
            root_epoch = root_epoch.max(boundary);
            if let Some(dir) = &self.data_dir {
                dir.set_root_epoch(EngineKind::Layered, root_epoch)?;
            }
            wal.commit(entry.seq)?;
            replayed += 1;
        }

        self.chains.write().root_epoch = root_epoch;
        wal.clear()?;

        info!(replayed, root_epoch = root_epoch.0, "recovered interrupted solidify");
        Ok(())
    }

    /// Fold the planned layers one epoch at a time. No chain lock is held.
    /// The roots written by each finished step are pushed to `folded`, also
    /// when a later step fails.
    fn write_fold(
        &self,
        base: Epoch,
        count: usize,
        plan: &[FoldChain],
        folded: &mut Vec<Vec<Arc<Layer>>>,
    ) -> Result<()> {
        let mut tops: Vec<Arc<Layer>> = plan.iter().map(|chain| Arc::clone(&chain.root)).collect();
        for step in 0..count {
            let boundary = Epoch(base.0 + step as u64 + 1);
            let roots = self.fold_step(boundary, step, plan, &tops)?;
            tops = roots.clone();
            folded.push(roots);
        }
        if let Some(wal) = &self.wal {
            wal.clear()?;
        }
        Ok(())
    }

    /// Write the `step`-th oldest delta of every chain to its backing and
    /// return the roots at `boundary`.
    ///
    /// `tops` are retired before the backings change, so readers below the
    /// boundary keep their values while the batch is written.
    fn fold_step(
        &self,
        boundary: Epoch,
        step: usize,
        plan: &[FoldChain],
        tops: &[Arc<Layer>],
    ) -> Result<Vec<Arc<Layer>>> {
        let mut batches = Vec::with_capacity(plan.len());
        let mut priors = Vec::with_capacity(plan.len());
        for (chain, top) in plan.iter().zip(tops) {
            let entries = chain
                .layers
                .get(step)
                .map(|layer| layer.delta_entries())
                .unwrap_or_default();
            let mut undo = BTreeMap::new();
            for (key, _) in &entries {
                undo.insert(key.clone(), Entry::from(top.get(key)?));
            }
            priors.push(undo);
            batches.push(StoreBatch {
                store: chain.name.clone(),
                entries,
            });
        }

        let seq = match &self.wal {
            Some(wal) => Some(wal.log(WalOperation::Fold {
                boundary,
                stores: batches.clone(),
            })?),
            None => None,
        };

        let roots: Vec<Arc<Layer>> = plan
            .iter()
            .map(|chain| Layer::root(Arc::clone(&chain.backing), boundary))
            .collect();
        for ((top, undo), root) in tops.iter().zip(&priors).zip(&roots) {
            top.retire(undo.clone(), Arc::clone(root));
        }

        if let Err(e) = self.apply_step(boundary, plan, &batches) {
            self.undo_step(boundary, plan, tops, &priors);
            return Err(e);
        }
        debug!(boundary = boundary.0, seq = ?seq, "fold step written");
        Ok(roots)
    }

    fn apply_step(&self, boundary: Epoch, plan: &[FoldChain], batches: &[StoreBatch]) -> Result<()> {
        for (chain, batch) in plan.iter().zip(batches) {
            chain.backing.write_batch(&batch.entries)?;
            chain.backing.flush()?;
        }
        if let Some(dir) = &self.data_dir {
            dir.set_root_epoch(EngineKind::Layered, boundary)?;
        }
        if let Some(wal) = &self.wal {
            // Earlier attempts at this step are settled too.
            for entry in wal.get_pending_entries()? {
                wal.commit(entry.seq)?;
            }
        }
        Ok(())
    }

    /// Put back what a failed step may have written. On success the old roots
    /// are live again; otherwise they stay retired and keep serving their
    /// epoch, and the logged step is replayed on the next open.
    fn undo_step(
        &self,
        boundary: Epoch,
        plan: &[FoldChain],
        tops: &[Arc<Layer>],
        priors: &[BTreeMap<Vec<u8>, Entry>],
    ) {
        let restored = plan.iter().zip(priors).try_for_each(|(chain, undo)| {
            let batch: Vec<(Vec<u8>, Entry)> =
                undo.iter().map(|(k, e)| (k.clone(), e.clone())).collect();
            chain.backing.write_batch(&batch)?;
            chain.backing.flush()
        });
        let restored = restored.and_then(|()| match (&self.data_dir, boundary.prev()) {
            (Some(dir), Some(previous)) => dir.set_root_epoch(EngineKind::Layered, previous),
            _ => Ok(()),
        });
        let restored = restored.and_then(|()| match &self.wal {
            Some(wal) => wal.clear(),
            None => Ok(()),
        });

        match restored {
            Ok(()) => {
                for top in tops {
                    top.reinstate();
                }
            }
            Err(e) => warn!(
                error = %e,
                boundary = boundary.0,
                "could not undo partial fold step"
            ),
        }
    }

    fn sync(&self) -> Result<()> {
        for backing in self.backings.lock().values() {
            backing.flush()?;
        }
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Best-effort sync on drop
        if let Err(e) = self.sync() {
            warn!(error = %e, "flush on drop failed");
        }
    }
}

/// The layered engine: one chain of snapshot layers per registered store,
/// advanced, folded and revoked together.
///
/// Cloning is cheap; clones share the same chains.
#[derive(Clone)]
pub struct SnapshotManager {
    shared: Arc<Shared>,
}

impl SnapshotManager {
    /// Open an engine. With `config.path` set, roots live in files under that
    /// directory and any interrupted solidify is replayed before returning.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let Some(path) = config.path.clone() else {
            return Self::with_provider(config, MemoryProvider);
        };

        let data_dir = DataDir::open(&path)?;
        let manifest = data_dir.load_manifest(EngineKind::Layered)?;
        let wal = if config.checkpoint {
            Some(WriteAheadLog::open(data_dir.join(WAL_FILE))?)
        } else {
            None
        };
        let provider = FileProvider::new(
            data_dir.path(),
            config.value_cache_size,
            config.sync_interval,
        );

        let manager = Self::build(config, Box::new(provider), Some(data_dir), wal, manifest.root_epoch);
        manager.shared.recover()?;
        info!(
            path = %path.display(),
            root_epoch = manager.root_epoch().0,
            "opened layered engine"
        );
        Ok(manager)
    }

    /// In-memory engine with default configuration.
    pub fn in_memory() -> Self {
        Self::build(
            EngineConfig::in_memory(),
            Box::new(MemoryProvider),
            None,
            None,
            Epoch(0),
        )
    }

    /// Engine whose roots come from a caller-supplied provider. Nothing is
    /// checkpointed; the provider owns durability.
    pub fn with_provider(
        config: EngineConfig,
        provider: impl BackingProvider + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, Box::new(provider), None, None, Epoch(0)))
    }

    fn build(
        config: EngineConfig,
        provider: Box<dyn BackingProvider>,
        data_dir: Option<DataDir>,
        wal: Option<WriteAheadLog>,
        root_epoch: Epoch,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                provider,
                data_dir,
                wal,
                chains: RwLock::new(Chains {
                    stores: BTreeMap::new(),
                    root_epoch,
                    depth: 0,
                    solid: None,
                    pbft: None,
                    pinned: 0,
                }),
                backings: Mutex::new(HashMap::new()),
                write_lock: Mutex::new(()),
                solidify_lock: Mutex::new(()),
                events: SubscriptionManager::new(),
            }),
        }
    }

    /// Register a store over an explicit backing instead of the provider's.
    pub fn register_store_with(&self, name: &str, backing: Arc<dyn BackingStore>) -> Result<Chain> {
        {
            let mut backings = self.shared.backings.lock();
            backings
                .entry(name.to_string())
                .or_insert_with(|| Arc::clone(&backing));
        }
        self.attach(name, backing)
    }

    fn attach(&self, name: &str, backing: Arc<dyn BackingStore>) -> Result<Chain> {
        let _writer = self.shared.write_lock.lock();
        {
            let mut chains = self.shared.chains.write();
            if chains.stores.contains_key(name) {
                return Ok(Chain::new(name, Arc::clone(&self.shared)));
            }

            let mut chain = ChainState::new(name, Layer::root(backing, chains.root_epoch));
            for _ in 0..chains.depth {
                let next = chain.head.advance();
                chain.push(next);
            }
            if let Some(epoch) = chains.solid {
                chain.solid = Some(chain.find(epoch));
            }
            if let Some(epoch) = chains.pbft {
                chain.pbft = Some(chain.find(epoch));
            }
            let depth = chains.depth;
            chains.stores.insert(name.to_string(), chain);
            debug!(store = name, depth, "registered store");
        }

        self.shared.events.broadcast(EngineEvent::StoreRegistered {
            name: name.to_string(),
        });
        Ok(Chain::new(name, Arc::clone(&self.shared)))
    }

    /// Capture the layer a cursor designates on every store at once.
    pub fn view(&self, cursor: Cursor) -> View {
        let chains = self.shared.chains.read();
        let epoch = match cursor {
            Cursor::Head => chains.head_epoch(),
            _ => chains.marker(cursor).unwrap_or(chains.root_epoch),
        };
        let layers = chains
            .stores
            .iter()
            .map(|(name, chain)| (name.clone(), chain.cursor_layer(cursor)))
            .collect();
        View::new(cursor, epoch, layers)
    }

    /// Subscribe with the configured per-subscriber buffer.
    pub fn events(&self, filter: SubscriptionFilter) -> SubscriptionHandle {
        self.subscribe(SubscriptionConfig {
            buffer_size: self.shared.config.event_buffer,
            filter,
        })
    }

    /// Flush every backing.
    pub fn sync(&self) -> Result<()> {
        self.shared.sync()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Phase one of `solidify`: validate and pin the layers to fold.
    fn plan_fold(&self, count: usize) -> Result<(Epoch, Vec<FoldChain>)> {
        let _writer = self.shared.write_lock.lock();
        let mut chains = self.shared.chains.write();

        if count >= chains.depth {
            return Err(StoreError::violation(format!(
                "solidify of {} layers would fold the head (depth {})",
                count, chains.depth
            )));
        }
        let boundary = Epoch(chains.root_epoch.0 + count as u64);
        if let Some((cursor, marker)) = chains.markers().find(|(_, m)| *m < boundary) {
            return Err(StoreError::violation(format!(
                "solidify through {} would fold past {} marker at {}",
                boundary, cursor, marker
            )));
        }

        let mut plan = Vec::with_capacity(chains.stores.len());
        for chain in chains.stores.values() {
            let backing = chain.root.backing().cloned().ok_or_else(|| {
                StoreError::violation(format!("chain {} root has no backing", chain.name))
            })?;
            plan.push(FoldChain {
                name: chain.name.clone(),
                backing,
                root: Arc::clone(&chain.root),
                layers: chain.deltas().into_iter().take(count).collect(),
            });
        }
        chains.pinned = count;
        Ok((chains.root_epoch, plan))
    }

    /// Phase three of `solidify`: rebase every chain on the newest written
    /// root and release the pin. `folded` holds, per finished step, one root
    /// per planned chain.
    fn relink(&self, plan: &[FoldChain], folded: &[Vec<Arc<Layer>>]) {
        let _writer = self.shared.write_lock.lock();
        let mut chains = self.shared.chains.write();

        let steps = folded.len();
        if steps > 0 {
            let boundary = Epoch(chains.root_epoch.0 + steps as u64);
            let mut planned: HashMap<&str, Vec<Arc<Layer>>> = plan
                .iter()
                .enumerate()
                .map(|(index, chain)| {
                    let roots = folded
                        .iter()
                        .filter_map(|step| step.get(index).cloned())
                        .collect();
                    (chain.name.as_str(), roots)
                })
                .collect();

            for chain in chains.stores.values_mut() {
                let roots = match planned.remove(chain.name.as_str()) {
                    Some(roots) => roots,
                    None => {
                        // Registered while the fold ran: its deltas are empty.
                        let Some(backing) = chain.root.backing().cloned() else {
                            continue;
                        };
                        vec![Layer::root(backing, boundary); steps]
                    }
                };
                chain.rebase(&roots);
            }

            chains.root_epoch = boundary;
            chains.depth -= steps;
        }
        chains.pinned = 0;
    }
}

impl RevokingEngine for SnapshotManager {
    type Store = Chain;

    fn register_store(&self, name: &str) -> Result<Chain> {
        if self.shared.chains.read().stores.contains_key(name) {
            return Ok(Chain::new(name, Arc::clone(&self.shared)));
        }
        let backing = self.shared.backing_for(name)?;
        self.attach(name, backing)
    }

    fn store(&self, name: &str) -> Result<Chain> {
        self.shared.chains.read().chain(name)?;
        Ok(Chain::new(name, Arc::clone(&self.shared)))
    }

    fn store_names(&self) -> Vec<String> {
        self.shared.chains.read().stores.keys().cloned().collect()
    }

    fn advance_all(&self) -> Result<Epoch> {
        let _writer = self.shared.write_lock.lock();
        let epoch = {
            let mut chains = self.shared.chains.write();
            let heads: Vec<(String, Arc<Layer>)> = chains
                .stores
                .iter()
                .map(|(name, chain)| (name.clone(), chain.head.advance()))
                .collect();
            for (name, head) in heads {
                if let Some(chain) = chains.stores.get_mut(&name) {
                    chain.push(head);
                }
            }
            chains.depth += 1;
            chains.head_epoch()
        };

        debug!(epoch = epoch.0, "advanced");
        self.shared.events.broadcast(EngineEvent::Advanced { epoch });
        Ok(epoch)
    }

    fn revoke(&self) -> Result<Epoch> {
        let _writer = self.shared.write_lock.lock();
        let epoch = {
            let mut chains = self.shared.chains.write();
            if chains.depth == 0 {
                return Err(StoreError::violation("revoke on root-only chain"));
            }
            if chains.pinned > 0 && chains.depth - 1 <= chains.pinned {
                return Err(StoreError::violation(format!(
                    "revoke would expose {} layers being solidified",
                    chains.pinned
                )));
            }
            let epoch = chains.head_epoch();
            if let Some(cursor) = chains.marked_at(epoch) {
                return Err(StoreError::violation(format!(
                    "revoke of epoch {} marked {}",
                    epoch, cursor
                )));
            }

            for chain in chains.stores.values_mut() {
                chain.pop()?;
            }
            chains.depth -= 1;
            epoch
        };

        debug!(epoch = epoch.0, "revoked");
        self.shared.events.broadcast(EngineEvent::Revoked { epoch });
        Ok(epoch)
    }

    fn merge(&self) -> Result<Epoch> {
        let _writer = self.shared.write_lock.lock();
        let into = {
            let mut chains = self.shared.chains.write();
            if chains.depth < 2 || chains.depth - chains.pinned < 2 {
                return Err(StoreError::violation(format!(
                    "merge needs two unpinned layers (depth {}, pinned {})",
                    chains.depth, chains.pinned
                )));
            }
            let head = chains.head_epoch();
            let into = Epoch(head.0 - 1);
            for epoch in [into, head] {
                if let Some(cursor) = chains.marked_at(epoch) {
                    return Err(StoreError::violation(format!(
                        "merge across epoch {} marked {}",
                        epoch, cursor
                    )));
                }
            }

            for chain in chains.stores.values_mut() {
                let top = Arc::clone(&chain.head);
                if let Some(below) = top.previous() {
                    below.absorb(top.delta_entries());
                }
                chain.pop()?;
            }
            chains.depth -= 1;
            into
        };

        debug!(into = into.0, "merged head");
        self.shared.events.broadcast(EngineEvent::Merged { into });
        Ok(into)
    }

    fn solidify(&self, count: usize) -> Result<usize> {
        if count == 0 {
            return Ok(0);
        }
        let _solidifying = self.shared.solidify_lock.lock();

        let (base, plan) = self.plan_fold(count)?;

        let mut folded = Vec::with_capacity(count);
        let written = self.shared.write_fold(base, count, &plan, &mut folded);
        let done = folded.len();
        self.relink(&plan, &folded);

        let through = Epoch(base.0 + done as u64);
        if done > 0 {
            self.shared.events.broadcast(EngineEvent::Solidified {
                through,
                count: done,
            });
        }
        if let Err(e) = written {
            warn!(error = %e, done, requested = count, "solidify failed");
            return Err(e);
        }

        info!(count, through = through.0, stores = plan.len(), "solidified");
        Ok(count)
    }

    fn flush_if_needed(&self) -> Result<usize> {
        let Some(max) = self.shared.config.max_revocable_depth else {
            return Ok(0);
        };
        let count = {
            let chains = self.shared.chains.read();
            let mut count = chains.depth.saturating_sub(max);
            for (_, marker) in chains.markers() {
                count = count.min(marker.0.saturating_sub(chains.root_epoch.0) as usize);
            }
            count
        };
        if count == 0 {
            return Ok(0);
        }
        self.solidify(count)
    }

    fn reset(&self) -> Result<()> {
        let _writer = self.shared.write_lock.lock();
        let (root_epoch, dropped) = {
            let mut guard = self.shared.chains.write();
            let chains = &mut *guard;
            if chains.pinned > 0 {
                return Err(StoreError::violation("reset while solidify is in progress"));
            }

            for chain in chains.stores.values_mut() {
                chain.head = Arc::clone(&chain.root);
                chain.root.set_next(Weak::new());
                if chain.solid.is_some() {
                    chain.solid = Some(Arc::clone(&chain.root));
                }
                if chain.pbft.is_some() {
                    chain.pbft = Some(Arc::clone(&chain.root));
                }
            }
            let root_epoch = chains.root_epoch;
            if chains.solid.is_some() {
                chains.solid = Some(root_epoch);
            }
            if chains.pbft.is_some() {
                chains.pbft = Some(root_epoch);
            }
            let dropped = chains.depth;
            chains.depth = 0;
            (root_epoch, dropped)
        };

        info!(dropped, root_epoch = root_epoch.0, "reset to root");
        self.shared.events.broadcast(EngineEvent::Reset { root_epoch });
        Ok(())
    }

    fn mark(&self, cursor: Cursor, epoch: Epoch) -> Result<()> {
        if cursor == Cursor::Head {
            return Err(StoreError::InvalidOperation(
                "the HEAD cursor has no marker".into(),
            ));
        }

        let _writer = self.shared.write_lock.lock();
        {
            let mut chains = self.shared.chains.write();
            if let Some(current) = chains.marker(cursor) {
                if epoch < current {
                    return Err(StoreError::violation(format!(
                        "{} marker cannot move back from {} to {}",
                        cursor, current, epoch
                    )));
                }
                if epoch == current {
                    return Ok(());
                }
            }
            if epoch < chains.root_epoch || epoch > chains.head_epoch() {
                return Err(StoreError::violation(format!(
                    "{} marker at {} outside open epochs {}..={}",
                    cursor,
                    epoch,
                    chains.root_epoch,
                    chains.head_epoch()
                )));
            }
            let folding = Epoch(chains.root_epoch.0 + chains.pinned as u64);
            if epoch < folding {
                return Err(StoreError::violation(format!(
                    "{} marker at {} inside layers being solidified through {}",
                    cursor, epoch, folding
                )));
            }

            for chain in chains.stores.values_mut() {
                let layer = chain.find(epoch);
                if let Some(slot) = chain.marker_mut(cursor) {
                    *slot = Some(layer);
                }
            }
            match cursor {
                Cursor::Solid => chains.solid = Some(epoch),
                Cursor::Pbft => chains.pbft = Some(epoch),
                Cursor::Head => {}
            }
        }

        debug!(%cursor, epoch = epoch.0, "marker moved");
        self.shared
            .events
            .broadcast(EngineEvent::MarkerMoved { cursor, epoch });
        Ok(())
    }

    fn marker(&self, cursor: Cursor) -> Option<Epoch> {
        self.shared.chains.read().marker(cursor)
    }

    fn read(&self, cursor: Cursor, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.layer(cursor, store)?.get(key)
    }

    fn depth(&self) -> usize {
        self.shared.chains.read().depth
    }

    fn head_epoch(&self) -> Epoch {
        self.shared.chains.read().head_epoch()
    }

    fn root_epoch(&self) -> Epoch {
        self.shared.chains.read().root_epoch
    }

    fn stats(&self) -> EngineStats {
        let chains = self.shared.chains.read();
        EngineStats {
            store_count: chains.stores.len(),
            depth: chains.depth,
            root_epoch: chains.root_epoch,
            head_epoch: chains.head_epoch(),
            solid_marker: chains.solid,
            pbft_marker: chains.pbft,
            chains: chains.stores.values().map(ChainState::stats).collect(),
        }
    }

    fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.shared.events.subscribe(config)
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chains = self.shared.chains.read();
        f.debug_struct("SnapshotManager")
            .field("stores", &chains.stores.len())
            .field("root_epoch", &chains.root_epoch)
            .field("depth", &chains.depth)
            .finish()
    }
}
