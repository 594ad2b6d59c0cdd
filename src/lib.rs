//! # chainkv
//!
//! Revocable, layered key/value state for a blockchain node.
//!
//! ## Core Concepts
//!
//! - **Stores**: named keyspaces, each with its own chain of layers
//! - **Epochs**: one block's changes; every store advances, folds and revokes
//!   at the same epoch boundary
//! - **Solidify**: fold confirmed old epochs into durable storage
//! - **Revoke**: discard the newest epoch on every store
//! - **Cursors**: read from the head, the solidified point or the BFT-final
//!   point while the writer keeps going
//!
//! Two engines implement [`RevokingEngine`]: the layered
//! [`SnapshotManager`] and the undo-log [`UndoLogManager`].
//!
//! ## Example
//!
//! ```ignore
//! use chainkv::{Cursor, EngineConfig, KeyValueStore, RevokingEngine, SnapshotManager};
//!
//! let engine = SnapshotManager::open(EngineConfig::at("./state"))?;
//! let account = engine.register_store("account")?;
//!
//! engine.advance_all()?;
//! account.put(b"alice", b"100")?;
//! engine.advance_all()?;
//! account.put(b"alice", b"150")?;
//!
//! engine.solidify(1)?;
//! assert_eq!(engine.read(Cursor::Solid, "account", b"alice")?, Some(b"100".to_vec()));
//!
//! engine.revoke()?;
//! assert_eq!(account.get(b"alice")?, Some(b"100".to_vec()));
//! ```

pub mod backing;
pub mod config;
mod datadir;
pub mod engine;
pub mod error;
pub mod journal;
pub mod session;
pub mod snapshot;
pub mod solidifier;
pub mod subscriptions;
pub mod types;
pub mod wal;

// Re-exports
pub use backing::{
    BackingProvider, BackingStore, FileBacking, FileProvider, MemoryBacking, MemoryProvider,
};
pub use config::EngineConfig;
pub use datadir::{EngineKind, Manifest};
pub use engine::{KeyValueStore, RevokingEngine};
pub use error::{Result, StoreError};
pub use journal::{JournalStore, UndoLogManager};
pub use session::{execute, Session};
pub use snapshot::{Chain, Layer, SnapshotManager, View};
pub use solidifier::Solidifier;
pub use subscriptions::{
    DropReason, EngineEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, SubscriptionManager,
};
pub use types::*;
pub use wal::{StoreBatch, WalEntry, WalEntryStatus, WalOperation, WriteAheadLog};
