//! Data directory: exclusive lock and manifest.

use crate::error::{Result, StoreError};
use crate::types::Epoch;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current manifest format version.
const MANIFEST_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST.json";
const LOCK_FILE: &str = "LOCK";

/// Which engine owns a data directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Layered,
    UndoLog,
}

/// Persistent facts about a data directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u8,
    pub engine: EngineKind,
    /// Epoch the durable stores represent.
    pub root_epoch: Epoch,
}

/// An exclusively locked data directory.
pub(crate) struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Create if missing and take the exclusive lock.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let lock_file = File::create(path.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Load the manifest, writing a fresh one for a new directory.
    pub(crate) fn load_manifest(&self, engine: EngineKind) -> Result<Manifest> {
        let path = self.join(MANIFEST_FILE);
        if !path.exists() {
            let manifest = Manifest {
                version: MANIFEST_VERSION,
                engine,
                root_epoch: Epoch(0),
            };
            self.write_manifest(&manifest)?;
            return Ok(manifest);
        }

        let raw = fs::read(&path)?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::InvalidFormat(format!("Invalid manifest: {}", e)))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported manifest version: {}",
                manifest.version
            )));
        }
        if manifest.engine != engine {
            return Err(StoreError::InvalidFormat(format!(
                "Data directory belongs to the {:?} engine",
                manifest.engine
            )));
        }
        Ok(manifest)
    }

    /// Replace the manifest atomically.
    pub(crate) fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let tmp = self.join("MANIFEST.json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(manifest)?)?;
            file.sync_all()?;
        }
        fs::rename(tmp, self.join(MANIFEST_FILE))?;
        Ok(())
    }

    pub(crate) fn set_root_epoch(&self, engine: EngineKind, root_epoch: Epoch) -> Result<()> {
        self.write_manifest(&Manifest {
            version: MANIFEST_VERSION,
            engine,
            root_epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _first = DataDir::open(dir.path()).unwrap();
        assert!(matches!(DataDir::open(dir.path()), Err(StoreError::Locked)));
    }

    #[test]
    fn test_manifest_roundtrip_and_engine_check() {
        let dir = TempDir::new().unwrap();
        let data = DataDir::open(dir.path()).unwrap();

        let fresh = data.load_manifest(EngineKind::Layered).unwrap();
        assert_eq!(fresh.root_epoch, Epoch(0));

        data.set_root_epoch(EngineKind::Layered, Epoch(42)).unwrap();
        assert_eq!(
            data.load_manifest(EngineKind::Layered).unwrap().root_epoch,
            Epoch(42)
        );
        assert!(matches!(
            data.load_manifest(EngineKind::UndoLog),
            Err(StoreError::InvalidFormat(_))
        ));
    }
}
