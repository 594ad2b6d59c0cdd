//! Checkpoint log for multi-store folds and undo journals.
//!
//! A fold writes to every store's backing. Before the first backing is
//! touched the whole batch is logged here and synced, so a crash part way
//! through can be replayed on open and no store is left at another epoch.
//!
//! The undo-log engine keeps its journal in the same format: one entry per
//! write made while epochs are open, replayed in reverse on open.

use crate::error::{Result, StoreError};
use crate::types::{Entry, Epoch, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for WAL file.
const WAL_MAGIC: &[u8; 4] = b"WAL\0";

/// Current WAL format version.
const WAL_VERSION: u8 = 1;

/// Largest encoded entry accepted on either side.
const MAX_ENTRY_BYTES: usize = 1 << 30;

/// WAL entry status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryStatus {
    /// Logged, not yet applied to every backing.
    Pending,
    /// Applied everywhere.
    Committed,
}

/// A single WAL entry. Commit markers carry no operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub status: WalEntryStatus,
    pub operation: Option<WalOperation>,
    pub timestamp: Timestamp,
}

/// One store's share of a fold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreBatch {
    pub store: String,
    pub entries: Vec<(Vec<u8>, Entry)>,
}

/// Operations that can be recorded in the WAL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalOperation {
    /// Fold layers up to `boundary` into every listed store.
    Fold {
        boundary: Epoch,
        stores: Vec<StoreBatch>,
    },
    /// `key` held `prior` before a write made during `epoch`.
    Undo {
        epoch: Epoch,
        store: String,
        key: Vec<u8>,
        prior: Option<Vec<u8>>,
    },
    /// Everything through `boundary` is solidified.
    Solidified { boundary: Epoch },
}

/// Write-Ahead Log manager.
pub struct WriteAheadLog {
    path: PathBuf,
    next_seq: Mutex<u64>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl WriteAheadLog {
    /// Create or open a WAL file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, writer) = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let mut reader = BufReader::new(file);

            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if &magic != WAL_MAGIC {
                return Err(StoreError::InvalidFormat("Invalid WAL magic".into()));
            }

            let mut version = [0u8; 1];
            reader.read_exact(&mut version)?;
            if version[0] != WAL_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "Unsupported WAL version: {}",
                    version[0]
                )));
            }

            let mut max_seq = 0u64;
            let mut valid_end = 5u64;
            while let Ok((entry, size)) = Self::read_entry(&mut reader) {
                max_seq = max_seq.max(entry.seq);
                valid_end += size;
            }
            drop(reader);

            // Cut a torn tail so later appends stay readable.
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > valid_end {
                file.set_len(valid_end)?;
                file.sync_all()?;
            }
            drop(file);

            let file = OpenOptions::new().append(true).open(&path)?;
            (max_seq + 1, Some(BufWriter::new(file)))
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;

            file.write_all(WAL_MAGIC)?;
            file.write_all(&[WAL_VERSION])?;
            file.sync_all()?;

            (1, Some(BufWriter::new(file)))
        };

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(writer),
        })
    }

    /// Log an operation and sync it. Returns its sequence number.
    pub fn log(&self, operation: WalOperation) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;

        let entry = WalEntry {
            seq,
            status: WalEntryStatus::Pending,
            operation: Some(operation),
            timestamp: Timestamp::now(),
        };
        self.append(&entry)?;
        Ok(seq)
    }

    /// Mark an entry as applied.
    pub fn commit(&self, seq: u64) -> Result<()> {
        let marker = WalEntry {
            seq,
            status: WalEntryStatus::Committed,
            operation: None,
            timestamp: Timestamp::now(),
        };
        self.append(&marker)
    }

    fn append(&self, entry: &WalEntry) -> Result<()> {
        let mut writer = self.writer.lock();
        if let Some(ref mut w) = *writer {
            Self::write_entry(w, entry)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Pending entries in log order.
    pub fn get_pending_entries(&self) -> Result<Vec<WalEntry>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(5))?;

        let mut reader = BufReader::new(file);
        let mut entries = BTreeMap::new();
        let mut committed = HashSet::new();

        // A torn tail ends the scan; it was never acknowledged.
        while let Ok((entry, _)) = Self::read_entry(&mut reader) {
            match entry.status {
                WalEntryStatus::Committed => {
                    committed.insert(entry.seq);
                }
                WalEntryStatus::Pending => {
                    entries.insert(entry.seq, entry);
                }
            }
        }

        Ok(entries
            .into_iter()
            .filter(|(seq, _)| !committed.contains(seq))
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Truncate to an empty log.
    pub fn clear(&self) -> Result<()> {
        let mut next_seq = self.next_seq.lock();
        let mut writer = self.writer.lock();
        *writer = None;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(WAL_MAGIC)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;

        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));

        *next_seq = 1;

        Ok(())
    }

    /// Atomically replace the log with `operations`, all pending.
    pub fn rewrite(&self, operations: Vec<WalOperation>) -> Result<()> {
        let mut next_seq = self.next_seq.lock();
        let mut writer = self.writer.lock();

        let tmp = self.path.with_extension("rewrite");
        let last = {
            let mut out = BufWriter::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp)?,
            );
            out.write_all(WAL_MAGIC)?;
            out.write_all(&[WAL_VERSION])?;
            let mut seq = 1u64;
            for operation in operations {
                let entry = WalEntry {
                    seq,
                    status: WalEntryStatus::Pending,
                    operation: Some(operation),
                    timestamp: Timestamp::now(),
                };
                Self::write_entry(&mut out, &entry)?;
                seq += 1;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
            seq
        };

        fs::rename(&tmp, &self.path)?;
        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));
        *next_seq = last;
        Ok(())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.get_pending_entries()?.is_empty())
    }

    fn write_entry(writer: &mut BufWriter<File>, entry: &WalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;
        if encoded.len() > MAX_ENTRY_BYTES {
            return Err(StoreError::InvalidOperation(format!(
                "WAL entry of {} bytes exceeds {}",
                encoded.len(),
                MAX_ENTRY_BYTES
            )));
        }

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Read one entry; also returns its size on disk.
    fn read_entry(reader: &mut BufReader<File>) -> Result<(WalEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_BYTES {
            return Err(StoreError::InvalidFormat("WAL entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, 8 + len as u64))
    }
}
