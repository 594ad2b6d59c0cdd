//! Undo-log manager and store handle.

use crate::backing::{BackingProvider, BackingStore, FileProvider, MemoryProvider};
use crate::config::EngineConfig;
use crate::datadir::{DataDir, EngineKind};
use crate::engine::{KeyValueStore, RevokingEngine};
use crate::error::{Result, StoreError};
use crate::subscriptions::{
    EngineEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionManager,
};
use crate::types::{ChainStats, Cursor, EngineStats, Entry, Epoch};
use crate::wal::{WalOperation, WriteAheadLog};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "undo.wal";

/// Value a key held before a logged write.
#[derive(Clone, Debug)]
struct UndoEntry {
    store: String,
    key: Vec<u8>,
    prior: Option<Vec<u8>>,
}

/// Writes made during one epoch, in write order.
#[derive(Debug)]
struct EpochLog {
    epoch: Epoch,
    undo: Vec<UndoEntry>,
}

struct JournalState {
    stores: BTreeMap<String, Arc<dyn BackingStore>>,
    /// Open epochs, oldest first.
    epochs: VecDeque<EpochLog>,
    root_epoch: Epoch,
    solid: Option<Epoch>,
    pbft: Option<Epoch>,
}

impl JournalState {
    fn depth(&self) -> usize {
        self.epochs.len()
    }

    fn head_epoch(&self) -> Epoch {
        Epoch(self.root_epoch.0 + self.epochs.len() as u64)
    }

    fn marker(&self, cursor: Cursor) -> Option<Epoch> {
        match cursor {
            Cursor::Head => None,
            Cursor::Solid => self.solid,
            Cursor::Pbft => self.pbft,
        }
    }

    fn marked_at(&self, epoch: Epoch) -> Option<Cursor> {
        [(Cursor::Solid, self.solid), (Cursor::Pbft, self.pbft)]
            .into_iter()
            .find(|(_, marker)| *marker == Some(epoch))
            .map(|(cursor, _)| cursor)
    }

    fn backing(&self, name: &str) -> Result<&Arc<dyn BackingStore>> {
        self.stores
            .get(name)
            .ok_or_else(|| StoreError::StoreNotRegistered(name.to_string()))
    }

    /// Epoch a cursor reads at. Unset markers read the solidified state.
    fn cursor_epoch(&self, cursor: Cursor) -> Epoch {
        match cursor {
            Cursor::Head => self.head_epoch(),
            _ => self.marker(cursor).unwrap_or(self.root_epoch),
        }
    }

    /// Value of `key` as of `epoch`: the first prior logged after `epoch`,
    /// else whatever is physically stored.
    fn value_at(&self, store: &str, key: &[u8], epoch: Epoch) -> Result<Option<Vec<u8>>> {
        let backing = self.backing(store)?;
        for log in self.epochs.iter().filter(|log| log.epoch > epoch) {
            if let Some(entry) = log
                .undo
                .iter()
                .find(|entry| entry.store == store && entry.key == key)
            {
                return Ok(entry.prior.clone());
            }
        }
        backing.get(key)
    }

    fn iter_at(&self, store: &str, epoch: Epoch) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let backing = self.backing(store)?;
        let mut overrides: BTreeMap<&[u8], &Option<Vec<u8>>> = BTreeMap::new();
        for log in self.epochs.iter().filter(|log| log.epoch > epoch) {
            for entry in log.undo.iter().filter(|entry| entry.store == store) {
                overrides.entry(entry.key.as_slice()).or_insert(&entry.prior);
            }
        }
        if overrides.is_empty() {
            return backing.iter();
        }

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = backing.iter()?.into_iter().collect();
        for (key, prior) in overrides {
            match prior {
                Some(value) => {
                    merged.insert(key.to_vec(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Undo one epoch's writes, newest first.
    fn replay(&self, log: &EpochLog) -> Result<()> {
        for entry in log.undo.iter().rev() {
            let backing = self.backing(&entry.store)?;
            backing.write_batch(&[(entry.key.clone(), Entry::from(entry.prior.clone()))])?;
        }
        Ok(())
    }

    /// Journal records for every open epoch, in write order.
    fn journal_records(&self) -> Vec<WalOperation> {
        self.epochs
            .iter()
            .flat_map(|log| {
                log.undo.iter().map(|entry| WalOperation::Undo {
                    epoch: log.epoch,
                    store: entry.store.clone(),
                    key: entry.key.clone(),
                    prior: entry.prior.clone(),
                })
            })
            .collect()
    }
}

pub(crate) struct JournalShared {
    config: EngineConfig,
    provider: Box<dyn BackingProvider>,
    data_dir: Option<DataDir>,
    /// On-disk copy of the undo entries of open epochs.
    journal: Option<WriteAheadLog>,
    state: RwLock<JournalState>,
    /// Backings opened so far, including ones only touched by recovery.
    backings: Mutex<HashMap<String, Arc<dyn BackingStore>>>,
    write_lock: Mutex<()>,
    solidify_lock: Mutex<()>,
    events: SubscriptionManager,
}

impl JournalShared {
    fn write(&self, name: &str, key: &[u8], entry: Entry) -> Result<()> {
        let _writer = self.write_lock.lock();
        let mut state = self.state.write();
        let backing = Arc::clone(state.backing(name)?);

        if state.depth() > 0 {
            if let Some(cursor) = state.marked_at(state.head_epoch()) {
                return Err(StoreError::violation(format!(
                    "write into epoch {} marked {}",
                    state.head_epoch(),
                    cursor
                )));
            }
        }
        let head = state.head_epoch();
        if let Some(log) = state.epochs.back_mut() {
            let prior = backing.get(key)?;
            if let Some(journal) = &self.journal {
                journal.log(WalOperation::Undo {
                    epoch: head,
                    store: name.to_string(),
                    key: key.to_vec(),
                    prior: prior.clone(),
                })?;
            }
            log.undo.push(UndoEntry {
                store: name.to_string(),
                key: key.to_vec(),
                prior,
            });
        }
        backing.write_batch(&[(key.to_vec(), entry)])
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

    /// Bring the on-disk journal in line with `state` after epochs were
    /// dropped. Backings are flushed first so no replayed or solidified write
    /// is lost once its undo entries are gone.
    fn persist_journal(&self, state: &JournalState) -> Result<()> {
        for backing in state.stores.values() {
            backing.flush()?;
        }
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let mut records = vec![WalOperation::Solidified {
            boundary: state.root_epoch,
        }];
        records.extend(state.journal_records());
        journal.rewrite(records)
    }

    /// Undo writes of epochs that were still open when the engine stopped.
    /// Returns the root epoch to resume from.
    fn recover(&self, manifest_root: Epoch) -> Result<Epoch> {
        let Some(journal) = &self.journal else {
            return Ok(manifest_root);
        };
        let entries = journal.get_pending_entries()?;
        if entries.is_empty() {
            return Ok(manifest_root);
        }

        let mut root_epoch = manifest_root;
        let mut undone = 0usize;
        let mut touched = Vec::new();
        for entry in entries.into_iter().rev() {
            match entry.operation {
                Some(WalOperation::Undo {
                    store, key, prior, ..
                }) => {
                    let backing = self.backing_for(&store)?;
                    backing.write_batch(&[(key, Entry::from(prior))])?;
                    touched.push(backing);
                    undone += 1;
                }
                Some(WalOperation::Solidified { boundary }) => {
                    root_epoch = root_epoch.max(boundary);
                }
                _ => {}
            }
        }
        for backing in &touched {
            backing.flush()?;
        }
        if root_epoch != manifest_root {
            if let Some(dir) = &self.data_dir {
                dir.set_root_epoch(EngineKind::UndoLog, root_epoch)?;
            }
        }
        journal.clear()?;

        info!(undone, root_epoch = root_epoch.0, "undid epochs open at shutdown");
        Ok(root_epoch)
    }

    fn read(&self, cursor: Cursor, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        match cursor {
            Cursor::Head => state.backing(store)?.get(key),
            _ => state.value_at(store, key, state.cursor_epoch(cursor)),
        }
    }

    fn iter(&self, cursor: Cursor, store: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.read();
        match cursor {
            Cursor::Head => state.backing(store)?.iter(),
            _ => state.iter_at(store, state.cursor_epoch(cursor)),
        }
    }
}

/// Alternative engine: physical stores plus a per-epoch undo log.
///
/// Implements the same [`RevokingEngine`] contract as
/// [`crate::snapshot::SnapshotManager`]. On disk every undo entry is logged
/// before its write reaches a store, and epochs left open by a crash are
/// undone on the next open, so only solidified state survives a restart.
#[derive(Clone)]
pub struct UndoLogManager {
    shared: Arc<JournalShared>,
}

impl UndoLogManager {
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let Some(path) = config.path.clone() else {
            return Self::with_provider(config, MemoryProvider);
        };

        let data_dir = DataDir::open(&path)?;
        let manifest = data_dir.load_manifest(EngineKind::UndoLog)?;
        let journal = if config.checkpoint {
            Some(WriteAheadLog::open(data_dir.join(JOURNAL_FILE))?)
        } else {
            None
        };
        let provider = FileProvider::new(
            data_dir.path(),
            config.value_cache_size,
            config.sync_interval,
        );

        let manager = Self::build(
            config,
            Box::new(provider),
            Some(data_dir),
            journal,
            manifest.root_epoch,
        );
        let root_epoch = manager.shared.recover(manifest.root_epoch)?;
        manager.shared.state.write().root_epoch = root_epoch;
        info!(
            path = %path.display(),
            root_epoch = root_epoch.0,
            "opened undo-log engine"
        );
        Ok(manager)
    }

    pub fn in_memory() -> Self {
        Self::build(
            EngineConfig::in_memory(),
            Box::new(MemoryProvider),
            None,
            None,
            Epoch(0),
        )
    }

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
        journal: Option<WriteAheadLog>,
        root_epoch: Epoch,
    ) -> Self {
        Self {
            shared: Arc::new(JournalShared {
                config,
                provider,
                data_dir,
                journal,
                state: RwLock::new(JournalState {
                    stores: BTreeMap::new(),
                    epochs: VecDeque::new(),
                    root_epoch,
                    solid: None,
                    pbft: None,
                }),
                backings: Mutex::new(HashMap::new()),
                write_lock: Mutex::new(()),
                solidify_lock: Mutex::new(()),
                events: SubscriptionManager::new(),
            }),
        }
    }

    pub fn sync(&self) -> Result<()> {
        for backing in self.shared.state.read().stores.values() {
            backing.flush()?;
        }
        Ok(())
    }

    /// Logged writes per open epoch, oldest first.
    pub fn journal_lengths(&self) -> Vec<usize> {
        self.shared
            .state
            .read()
            .epochs
            .iter()
            .map(|log| log.undo.len())
            .collect()
    }
}

impl RevokingEngine for UndoLogManager {
    type Store = JournalStore;

    fn register_store(&self, name: &str) -> Result<JournalStore> {
        let handle = JournalStore {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        };
        if self.shared.state.read().stores.contains_key(name) {
            return Ok(handle);
        }

        let backing = self.shared.backing_for(name)?;
        {
            let _writer = self.shared.write_lock.lock();
            let mut state = self.shared.state.write();
            if state.stores.contains_key(name) {
                return Ok(handle);
            }
            state.stores.insert(name.to_string(), backing);
        }
        debug!(store = name, "registered store");
        self.shared.events.broadcast(EngineEvent::StoreRegistered {
            name: name.to_string(),
        });
        Ok(handle)
    }

    fn store(&self, name: &str) -> Result<JournalStore> {
        self.shared.state.read().backing(name)?;
        Ok(JournalStore {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }

    fn store_names(&self) -> Vec<String> {
        self.shared.state.read().stores.keys().cloned().collect()
    }

    fn advance_all(&self) -> Result<Epoch> {
        let _writer = self.shared.write_lock.lock();
        let epoch = {
            let mut state = self.shared.state.write();
            let epoch = state.head_epoch().next();
            state.epochs.push_back(EpochLog {
                epoch,
                undo: Vec::new(),
            });
            epoch
        };
        debug!(epoch = epoch.0, "advanced");
        self.shared.events.broadcast(EngineEvent::Advanced { epoch });
        Ok(epoch)
    }

    fn revoke(&self) -> Result<Epoch> {
        let _writer = self.shared.write_lock.lock();
        let (epoch, undone) = {
            let mut state = self.shared.state.write();
            let Some(log) = state.epochs.back() else {
                return Err(StoreError::violation("revoke on root-only chain"));
            };
            let epoch = log.epoch;
            if let Some(cursor) = state.marked_at(epoch) {
                return Err(StoreError::violation(format!(
                    "revoke of epoch {} marked {}",
                    epoch, cursor
                )));
            }

            // Replay before popping so a failed replay can be retried.
            state.replay(log)?;
            let undone = log.undo.len();
            state.epochs.pop_back();
            self.shared.persist_journal(&state)?;
            (epoch, undone)
        };

        debug!(epoch = epoch.0, undone, "revoked");
        self.shared.events.broadcast(EngineEvent::Revoked { epoch });
        Ok(epoch)
    }

    fn merge(&self) -> Result<Epoch> {
        let _writer = self.shared.write_lock.lock();
        let into = {
            let mut state = self.shared.state.write();
            if state.depth() < 2 {
                return Err(StoreError::violation(format!(
                    "merge needs two open epochs (depth {})",
                    state.depth()
                )));
            }
            let head = state.head_epoch();
            let into = Epoch(head.0 - 1);
            for epoch in [into, head] {
                if let Some(cursor) = state.marked_at(epoch) {
                    return Err(StoreError::violation(format!(
                        "merge across epoch {} marked {}",
                        epoch, cursor
                    )));
                }
            }

            if let Some(top) = state.epochs.pop_back() {
                if let Some(below) = state.epochs.back_mut() {
                    below.undo.extend(top.undo);
                }
            }
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
        let _writer = self.shared.write_lock.lock();
        let boundary = {
            let mut state = self.shared.state.write();
            if count >= state.depth() {
                return Err(StoreError::violation(format!(
                    "solidify of {} epochs would fold the head (depth {})",
                    count,
                    state.depth()
                )));
            }
            let boundary = Epoch(state.root_epoch.0 + count as u64);
            for cursor in [Cursor::Solid, Cursor::Pbft] {
                if let Some(marker) = state.marker(cursor).filter(|m| *m < boundary) {
                    return Err(StoreError::violation(format!(
                        "solidify through {} would fold past {} marker at {}",
                        boundary, cursor, marker
                    )));
                }
            }

            // The journal records the new root before the manifest does.
            let previous_root = state.root_epoch;
            let dropped: Vec<EpochLog> = state.epochs.drain(..count).collect();
            state.root_epoch = boundary;
            if let Err(e) = self.shared.persist_journal(&state) {
                for log in dropped.into_iter().rev() {
                    state.epochs.push_front(log);
                }
                state.root_epoch = previous_root;
                return Err(e);
            }
            if let Some(dir) = &self.shared.data_dir {
                dir.set_root_epoch(EngineKind::UndoLog, boundary)?;
            }
            boundary
        };

        info!(count, through = boundary.0, "solidified");
        self.shared.events.broadcast(EngineEvent::Solidified {
            through: boundary,
            count,
        });
        Ok(count)
    }

    fn flush_if_needed(&self) -> Result<usize> {
        let Some(max) = self.shared.config.max_revocable_depth else {
            return Ok(0);
        };
        let count = {
            let state = self.shared.state.read();
            let mut count = state.depth().saturating_sub(max);
            for marker in [state.solid, state.pbft].into_iter().flatten() {
                count = count.min(marker.0.saturating_sub(state.root_epoch.0) as usize);
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
            let mut state = self.shared.state.write();
            let dropped = state.depth();
            while let Some(log) = state.epochs.back() {
                state.replay(log)?;
                state.epochs.pop_back();
            }
            self.shared.persist_journal(&state)?;
            let root_epoch = state.root_epoch;
            if state.solid.is_some() {
                state.solid = Some(root_epoch);
            }
            if state.pbft.is_some() {
                state.pbft = Some(root_epoch);
            }
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
            let mut state = self.shared.state.write();
            if let Some(current) = state.marker(cursor) {
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
            if epoch < state.root_epoch || epoch > state.head_epoch() {
                return Err(StoreError::violation(format!(
                    "{} marker at {} outside open epochs {}..={}",
                    cursor,
                    epoch,
                    state.root_epoch,
                    state.head_epoch()
                )));
            }
            match cursor {
                Cursor::Solid => state.solid = Some(epoch),
                Cursor::Pbft => state.pbft = Some(epoch),
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
        self.shared.state.read().marker(cursor)
    }

    fn read(&self, cursor: Cursor, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.read(cursor, store, key)
    }

    fn depth(&self) -> usize {
        self.shared.state.read().depth()
    }

    fn head_epoch(&self) -> Epoch {
        self.shared.state.read().head_epoch()
    }

    fn root_epoch(&self) -> Epoch {
        self.shared.state.read().root_epoch
    }

    fn stats(&self) -> EngineStats {
        let state = self.shared.state.read();
        let chains = state
            .stores
            .keys()
            .map(|name| {
                let logged: Vec<&UndoEntry> = state
                    .epochs
                    .iter()
                    .flat_map(|log| log.undo.iter())
                    .filter(|entry| &entry.store == name)
                    .collect();
                ChainStats {
                    name: name.clone(),
                    root_epoch: state.root_epoch,
                    head_epoch: state.head_epoch(),
                    depth: state.depth(),
                    layer_entries: state
                        .epochs
                        .iter()
                        .map(|log| log.undo.iter().filter(|e| &e.store == name).count())
                        .collect(),
                    delta_bytes: logged
                        .iter()
                        .map(|e| e.key.len() + e.prior.as_ref().map_or(0, Vec::len))
                        .sum(),
                }
            })
            .collect();

        EngineStats {
            store_count: state.stores.len(),
            depth: state.depth(),
            root_epoch: state.root_epoch,
            head_epoch: state.head_epoch(),
            solid_marker: state.solid,
            pbft_marker: state.pbft,
            chains,
        }
    }

    fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.shared.events.subscribe(config)
    }
}

impl Drop for JournalShared {
    fn drop(&mut self) {
        for backing in self.state.get_mut().stores.values() {
            if let Err(e) = backing.flush() {
                warn!(store = backing.name(), error = %e, "flush on drop failed");
            }
        }
    }
}

/// Handle to one store of an [`UndoLogManager`].
#[derive(Clone)]
pub struct JournalStore {
    name: String,
    shared: Arc<JournalShared>,
}

impl JournalStore {
    pub fn get_at(&self, cursor: Cursor, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.read(cursor, &self.name, key)
    }

    pub fn iter_at(&self, cursor: Cursor) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.shared.iter(cursor, &self.name)
    }
}

impl KeyValueStore for JournalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(Cursor::Head, key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared
            .write(&self.name, key, Entry::Value(value.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.shared.write(&self.name, key, Entry::Tombstone)
    }

    fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.iter_at(Cursor::Head)
    }
}

impl std::fmt::Debug for JournalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalStore").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_replays_in_reverse() {
        let manager = UndoLogManager::in_memory();
        let account = manager.register_store("account").unwrap();
        account.put(b"alice", b"10").unwrap();

        manager.advance_all().unwrap();
        account.put(b"alice", b"20").unwrap();
        account.put(b"alice", b"30").unwrap();
        account.delete(b"alice").unwrap();
        account.put(b"bob", b"5").unwrap();
        assert_eq!(manager.journal_lengths(), vec![4]);

        manager.revoke().unwrap();
        assert_eq!(account.get(b"alice").unwrap(), Some(b"10".to_vec()));
        assert_eq!(account.get(b"bob").unwrap(), None);
    }

    #[test]
    fn test_writes_at_root_are_not_logged() {
        let manager = UndoLogManager::in_memory();
        let account = manager.register_store("account").unwrap();
        account.put(b"k", b"v").unwrap();

        assert!(manager.journal_lengths().is_empty());
        assert!(manager.revoke().is_err());
    }

    #[test]
    fn test_cursor_reads_reconstruct_marker_state() {
        let manager = UndoLogManager::in_memory();
        let account = manager.register_store("account").unwrap();

        manager.advance_all().unwrap();
        account.put(b"alice", b"100").unwrap();
        manager.advance_all().unwrap();
        account.put(b"alice", b"150").unwrap();
        account.put(b"carol", b"1").unwrap();
        manager.mark(Cursor::Solid, Epoch(1)).unwrap();

        assert_eq!(account.get_at(Cursor::Solid, b"alice").unwrap(), Some(b"100".to_vec()));
        assert_eq!(account.get_at(Cursor::Solid, b"carol").unwrap(), None);
        assert_eq!(account.get_at(Cursor::Pbft, b"alice").unwrap(), None);
        assert_eq!(
            account.iter_at(Cursor::Solid).unwrap(),
            vec![(b"alice".to_vec(), b"100".to_vec())]
        );
    }

    #[test]
    fn test_merge_then_revoke_restores_both() {
        let manager = UndoLogManager::in_memory();
        let account = manager.register_store("account").unwrap();
        manager.advance_all().unwrap();
        account.put(b"a", b"1").unwrap();
        manager.advance_all().unwrap();
        account.put(b"a", b"2").unwrap();

        assert_eq!(manager.merge().unwrap(), Epoch(1));
        assert_eq!(manager.journal_lengths(), vec![2]);
        manager.revoke().unwrap();
        assert_eq!(account.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_solidify_forgets_oldest_logs() {
        let manager = UndoLogManager::in_memory();
        let account = manager.register_store("account").unwrap();
        manager.advance_all().unwrap();
        account.put(b"alice", b"100").unwrap();
        manager.advance_all().unwrap();
        account.put(b"alice", b"150").unwrap();

        assert_eq!(manager.solidify(1).unwrap(), 1);
        assert_eq!(manager.root_epoch(), Epoch(1));
        manager.revoke().unwrap();
        assert_eq!(account.get(b"alice").unwrap(), Some(b"100".to_vec()));
        assert!(manager.revoke().is_err());
    }

    #[test]
    fn test_journal_file_follows_open_epochs() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = UndoLogManager::open(EngineConfig::at(dir.path())).unwrap();
        let account = manager.register_store("account").unwrap();
        let logged = |manager: &UndoLogManager| {
            let journal = manager.shared.journal.as_ref().unwrap();
            journal
                .get_pending_entries()
                .unwrap()
                .into_iter()
                .filter(|entry| matches!(entry.operation, Some(WalOperation::Undo { .. })))
                .count()
        };

        account.put(b"genesis", b"0").unwrap();
        assert_eq!(logged(&manager), 0);

        manager.advance_all().unwrap();
        account.put(b"a", b"1").unwrap();
        manager.advance_all().unwrap();
        account.put(b"a", b"2").unwrap();
        account.put(b"b", b"2").unwrap();
        assert_eq!(logged(&manager), 3);

        manager.revoke().unwrap();
        assert_eq!(logged(&manager), 1);

        manager.advance_all().unwrap();
        account.put(b"c", b"3").unwrap();
        manager.solidify(1).unwrap();
        assert_eq!(logged(&manager), 1);
        let first = manager.shared.journal.as_ref().unwrap().get_pending_entries().unwrap();
        assert_eq!(
            first[0].operation,
            Some(WalOperation::Solidified { boundary: Epoch(1) })
        );
    }

    #[test]
    fn test_reset_unwinds_every_epoch() {
        let manager = UndoLogManager::in_memory();
        let account = manager.register_store("account").unwrap();
        account.put(b"base", b"0").unwrap();
        for i in 0..4u8 {
            manager.advance_all().unwrap();
            account.put(b"base", &[i]).unwrap();
            account.put(&[i], b"x").unwrap();
        }

        manager.reset().unwrap();
        assert_eq!(
            account.iter().unwrap(),
            vec![(b"base".to_vec(), b"0".to_vec())]
        );
        assert_eq!(manager.depth(), 0);
    }
}
