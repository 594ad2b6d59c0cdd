//! Append-only file backing.
//!
//! Layout: a 5 byte header (magic + version) followed by batch frames:
//!
//! ```text
//! magic(4) | op count(4) | payload len(4) | payload | crc32(payload)(4)
//! op: tag(1) | key len(4) | key | [value len(4) | value]   (value only for puts)
//! ```
//!
//! The key index lives in memory and points at value bytes inside the file.
//! A frame that runs past the end of the file is a torn write and is cut off
//! on open.
//!
//! A batch larger than the frame limit is split across consecutive frames. A
//! crash between them leaves a prefix of the batch applied; folds recover from
//! that through the checkpoint log.

use super::{BackingProvider, BackingStore};
use crate::error::{Result, StoreError};
use crate::types::Entry;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes for a store file.
const STORE_MAGIC: &[u8; 4] = b"CKV\0";

/// Current store file format version.
const STORE_VERSION: u8 = 1;

const HEADER_SIZE: u64 = 5;

/// Magic bytes opening each batch frame.
const BATCH_MAGIC: &[u8; 4] = b"BAT\0";

/// magic + op count + payload length
const BATCH_HEADER_SIZE: u64 = 12;

/// Sanity bound on a single frame.
const MAX_BATCH_BYTES: u64 = 1 << 30;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

/// Where a live value sits in the file.
#[derive(Clone, Copy, Debug)]
struct ValuePtr {
    offset: u64,
    len: u32,
    crc: u32,
}

struct FileState {
    file: File,
    index: BTreeMap<Vec<u8>, ValuePtr>,
    file_size: u64,
    writes_since_sync: u64,
}

/// Outcome of reading one frame during replay.
enum Frame {
    Complete {
        ops: Vec<(Vec<u8>, Option<ValuePtr>)>,
        next: u64,
    },
    Torn,
}

/// Log-structured backing store, one file per logical store.
pub struct FileBacking {
    name: String,
    path: PathBuf,
    state: Mutex<FileState>,
    cache: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
    sync_interval: u64,
    /// Largest payload written into one frame.
    frame_limit: u64,
}

impl FileBacking {
    /// Open or create the store file at `path`.
    pub fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        cache_size: usize,
        sync_interval: u64,
    ) -> Result<Self> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();
        let (file, index, file_size) = Self::load(&name, &path)?;

        debug!(store = %name, keys = index.len(), bytes = file_size, "opened file backing");

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            name,
            path,
            state: Mutex::new(FileState {
                file,
                index,
                file_size,
                writes_since_sync: 0,
            }),
            cache: Mutex::new(LruCache::new(cache_size)),
            sync_interval: sync_interval.max(1),
            frame_limit: MAX_BATCH_BYTES,
        })
    }

    #[cfg(test)]
    fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = limit.min(MAX_BATCH_BYTES);
        self
    }

    fn load(name: &str, path: &Path) -> Result<(File, BTreeMap<Vec<u8>, ValuePtr>, u64)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(STORE_MAGIC)?;
            file.write_all(&[STORE_VERSION])?;
            file.sync_all()?;
            return Ok((file, BTreeMap::new(), HEADER_SIZE));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat(format!(
                "Invalid store magic in {}",
                path.display()
            )));
        }
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        let mut index = BTreeMap::new();
        let mut offset = HEADER_SIZE;
        while offset < len {
            match Self::read_frame(name, &mut file, offset, len)? {
                Frame::Complete { ops, next } => {
                    for (key, ptr) in ops {
                        match ptr {
                            Some(ptr) => {
                                index.insert(key, ptr);
                            }
                            None => {
                                index.remove(&key);
                            }
                        }
                    }
                    offset = next;
                }
                Frame::Torn => {
                    warn!(
                        store = %name,
                        offset,
                        discarded = len - offset,
                        "truncating torn batch at end of store file"
                    );
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        Ok((file, index, offset))
    }

    fn read_frame(name: &str, file: &mut File, offset: u64, len: u64) -> Result<Frame> {
        if offset + BATCH_HEADER_SIZE > len {
            return Ok(Frame::Torn);
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; BATCH_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != BATCH_MAGIC {
            return Err(corrupt(name, format!("bad batch magic at offset {}", offset)));
        }
        let count = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let payload_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as u64;
        if payload_len > MAX_BATCH_BYTES {
            return Err(corrupt(name, format!("batch at offset {} too large", offset)));
        }

        let next = offset + BATCH_HEADER_SIZE + payload_len + 4;
        if next > len {
            return Ok(Frame::Torn);
        }

        let mut payload = vec![0u8; payload_len as usize];
        file.read_exact(&mut payload)?;
        let mut crc_bytes = [0u8; 4];
        file.read_exact(&mut crc_bytes)?;
        let stored = u32::from_le_bytes(crc_bytes);
        let computed = crc32fast::hash(&payload);
        if stored != computed {
            if next == len {
                return Ok(Frame::Torn);
            }
            return Err(corrupt(
                name,
                format!("batch checksum mismatch at offset {}", offset),
            ));
        }

        let base = offset + BATCH_HEADER_SIZE;
        let ops = decode_ops(&payload, count, base)
            .ok_or_else(|| corrupt(name, format!("malformed batch at offset {}", offset)))?;

        Ok(Frame::Complete { ops, next })
    }

    /// Read a value without consulting the cache.
    fn read_value(&self, state: &mut FileState, ptr: ValuePtr) -> Result<Vec<u8>> {
        state.file.seek(SeekFrom::Start(ptr.offset))?;
        let mut buf = vec![0u8; ptr.len as usize];
        state.file.read_exact(&mut buf)?;
        if crc32fast::hash(&buf) != ptr.crc {
            return Err(corrupt(
                &self.name,
                format!("value checksum mismatch at offset {}", ptr.offset),
            ));
        }
        Ok(buf)
    }

    /// Current size of the store file in bytes.
    pub fn file_size(&self) -> u64 {
        self.state.lock().file_size
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file with only live values. Returns the bytes reclaimed.
    pub fn compact(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.file_size;

        let mut live = Vec::with_capacity(state.index.len());
        let pointers: Vec<_> = state.index.iter().map(|(k, p)| (k.clone(), *p)).collect();
        for (key, ptr) in pointers {
            let value = self.read_value(&mut state, ptr)?;
            live.push((key, Entry::Value(value)));
        }

        let tmp = self.path.with_extension("compact");
        {
            let mut out = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            out.write_all(STORE_MAGIC)?;
            out.write_all(&[STORE_VERSION])?;
            let (frames, _) = encode_frames(&self.name, &live, self.frame_limit)?;
            out.write_all(&frames)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let (file, index, file_size) = Self::load(&self.name, &self.path)?;
        state.file = file;
        state.index = index;
        state.file_size = file_size;
        state.writes_since_sync = 0;

        let reclaimed = before.saturating_sub(file_size);
        info!(store = %self.name, reclaimed, "compacted store file");
        Ok(reclaimed)
    }
}

impl BackingStore for FileBacking {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.cache.lock().get(key).cloned() {
            return Ok(Some(value));
        }

        let mut state = self.state.lock();
        let ptr = match state.index.get(key) {
            Some(ptr) => *ptr,
            None => return Ok(None),
        };
        let value = self.read_value(&mut state, ptr)?;
        // Filled while the state lock is held so a concurrent batch cannot be
        // overwritten by this older read.
        self.cache.lock().put(key.to_vec(), value.clone());
        Ok(Some(value))
    }

    fn write_batch(&self, batch: &[(Vec<u8>, Entry)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let (frames, value_positions) = encode_frames(&self.name, batch, self.frame_limit)?;

        let mut state = self.state.lock();
        let offset = state.file_size;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&frames)?;
        state.file_size = offset + frames.len() as u64;

        let mut cache = self.cache.lock();
        for ((key, entry), position) in batch.iter().zip(value_positions) {
            match (entry, position) {
                (Entry::Value(value), Some(position)) => {
                    state.index.insert(
                        key.clone(),
                        ValuePtr {
                            offset: offset + position as u64,
                            len: value.len() as u32,
                            crc: crc32fast::hash(value),
                        },
                    );
                    cache.put(key.clone(), value.clone());
                }
                _ => {
                    state.index.remove(key);
                    cache.pop(key);
                }
            }
        }
        drop(cache);

        state.writes_since_sync += 1;
        if state.writes_since_sync >= self.sync_interval {
            state.file.sync_data()?;
            state.writes_since_sync = 0;
        }

        Ok(())
    }

    fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut state = self.state.lock();
        let pointers: Vec<_> = state.index.iter().map(|(k, p)| (k.clone(), *p)).collect();
        let mut out = Vec::with_capacity(pointers.len());
        for (key, ptr) in pointers {
            let value = self.read_value(&mut state, ptr)?;
            out.push((key, value));
        }
        Ok(out)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.state.lock().index.len() as u64)
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.state.lock().index.contains_key(key))
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.sync_all()?;
        state.writes_since_sync = 0;
        Ok(())
    }
}

fn corrupt(store: &str, reason: String) -> StoreError {
    StoreError::Corrupt {
        store: store.to_string(),
        reason,
    }
}

/// Encoded size of one op inside a payload.
fn op_size(key: &[u8], entry: &Entry) -> u64 {
    let value = match entry {
        Entry::Value(value) => 4 + value.len() as u64,
        Entry::Tombstone => 0,
    };
    1 + 4 + key.len() as u64 + value
}

/// Encode a batch into as many frames as `limit` requires. Also returns, per
/// op, the position of its value bytes in the output (puts only).
fn encode_frames(
    store: &str,
    batch: &[(Vec<u8>, Entry)],
    limit: u64,
) -> Result<(Vec<u8>, Vec<Option<usize>>)> {
    let mut out = Vec::new();
    let mut positions = Vec::with_capacity(batch.len());
    let mut start = 0usize;
    while start < batch.len() {
        let mut end = start;
        let mut size = 0u64;
        while end < batch.len() {
            let (key, entry) = &batch[end];
            let next = op_size(key, entry);
            if size + next > limit {
                break;
            }
            size += next;
            end += 1;
        }
        if end == start {
            let (key, entry) = &batch[start];
            return Err(StoreError::InvalidOperation(format!(
                "entry of {} bytes in store {} exceeds the {} byte frame limit",
                op_size(key, entry),
                store,
                limit
            )));
        }

        let base = out.len() + BATCH_HEADER_SIZE as usize;
        let (frame, frame_positions) = encode_frame(&batch[start..end]);
        positions.extend(frame_positions.into_iter().map(|p| p.map(|p| base + p)));
        out.extend_from_slice(&frame);
        start = end;
    }
    Ok((out, positions))
}

/// Encode ops into one frame. Also returns, per op, the payload position of
/// its value bytes (puts only). Callers keep the payload within
/// [`MAX_BATCH_BYTES`], so every length fits in a `u32`.
fn encode_frame(batch: &[(Vec<u8>, Entry)]) -> (Vec<u8>, Vec<Option<usize>>) {
    let mut payload = Vec::new();
    let mut positions = Vec::with_capacity(batch.len());
    for (key, entry) in batch {
        match entry {
            Entry::Value(value) => {
                payload.push(OP_PUT);
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(key);
                payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
                positions.push(Some(payload.len()));
                payload.extend_from_slice(value);
            }
            Entry::Tombstone => {
                payload.push(OP_DELETE);
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(key);
                positions.push(None);
            }
        }
    }

    let mut frame = Vec::with_capacity(payload.len() + BATCH_HEADER_SIZE as usize + 4);
    frame.extend_from_slice(BATCH_MAGIC);
    frame.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    (frame, positions)
}

fn read_u32(payload: &[u8], pos: usize) -> Option<u32> {
    let bytes = payload.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode the ops of a verified payload. `None` on malformed layout.
fn decode_ops(payload: &[u8], count: usize, base: u64) -> Option<Vec<(Vec<u8>, Option<ValuePtr>)>> {
    let mut ops = Vec::with_capacity(count);
    let mut pos = 0usize;
    for _ in 0..count {
        let tag = *payload.get(pos)?;
        pos += 1;
        let key_len = read_u32(payload, pos)? as usize;
        pos += 4;
        let key = payload.get(pos..pos + key_len)?.to_vec();
        pos += key_len;
        match tag {
            OP_PUT => {
                let value_len = read_u32(payload, pos)? as usize;
                pos += 4;
                let value = payload.get(pos..pos + value_len)?;
                ops.push((
                    key,
                    Some(ValuePtr {
                        offset: base + pos as u64,
                        len: value_len as u32,
                        crc: crc32fast::hash(value),
                    }),
                ));
                pos += value_len;
            }
            OP_DELETE => ops.push((key, None)),
            _ => return None,
        }
    }
    if pos != payload.len() {
        return None;
    }
    Some(ops)
}

/// Opens one [`FileBacking`] per store inside a data directory.
#[derive(Clone, Debug)]
pub struct FileProvider {
    dir: PathBuf,
    cache_size: usize,
    sync_interval: u64,
}

impl FileProvider {
    pub fn new(dir: impl Into<PathBuf>, cache_size: usize, sync_interval: u64) -> Self {
        Self {
            dir: dir.into(),
            cache_size,
            sync_interval,
        }
    }

    /// File that holds the named store.
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.ckv", name))
    }
}

impl BackingProvider for FileProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn BackingStore>> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidConfig(format!(
                "store name {:?} is not usable as a file name",
                name
            )));
        }
        fs::create_dir_all(&self.dir)?;
        let backing = FileBacking::open(
            name,
            self.store_path(name),
            self.cache_size,
            self.sync_interval,
        )?;
        Ok(Arc::new(backing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(key: &str, value: &str) -> (Vec<u8>, Entry) {
        (key.as_bytes().to_vec(), Entry::Value(value.as_bytes().to_vec()))
    }

    fn del(key: &str) -> (Vec<u8>, Entry) {
        (key.as_bytes().to_vec(), Entry::Tombstone)
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let backing = FileBacking::open("t", dir.path().join("t.ckv"), 16, 1).unwrap();

        backing.write_batch(&[put("a", "1"), put("b", "2")]).unwrap();
        backing.write_batch(&[del("a")]).unwrap();

        assert_eq!(backing.get(b"a").unwrap(), None);
        assert_eq!(backing.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(backing.size().unwrap(), 1);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.ckv");

        {
            let backing = FileBacking::open("t", &path, 16, 1).unwrap();
            backing.write_batch(&[put("a", "1"), put("b", "2")]).unwrap();
            backing.write_batch(&[put("a", "3"), del("b")]).unwrap();
        }

        let backing = FileBacking::open("t", &path, 16, 1).unwrap();
        assert_eq!(backing.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(backing.get(b"b").unwrap(), None);
        assert_eq!(backing.iter().unwrap(), vec![(b"a".to_vec(), b"3".to_vec())]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.ckv");

        let good_size = {
            let backing = FileBacking::open("t", &path, 16, 1).unwrap();
            backing.write_batch(&[put("a", "1")]).unwrap();
            backing.file_size()
        };

        // Half of a second frame.
        let (frame, _) = encode_frame(&[put("b", "2")]);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let backing = FileBacking::open("t", &path, 16, 1).unwrap();
        assert_eq!(backing.file_size(), good_size);
        assert_eq!(backing.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backing.get(b"b").unwrap(), None);
    }

    #[test]
    fn test_flipped_value_byte_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.ckv");
        let backing = FileBacking::open("t", &path, 1, 1).unwrap();
        backing.write_batch(&[put("a", "hello")]).unwrap();
        backing.write_batch(&[put("b", "x")]).unwrap();

        // Evict "a" from the single-slot cache.
        backing.get(b"b").unwrap();

        let ptr = *backing.state.lock().index.get(&b"a".to_vec()).unwrap();
        {
            let mut state = backing.state.lock();
            state.file.seek(SeekFrom::Start(ptr.offset)).unwrap();
            state.file.write_all(b"J").unwrap();
        }

        let result = backing.get(b"a");
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_compact_reclaims_dead_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.ckv");
        let backing = FileBacking::open("t", &path, 16, 1).unwrap();

        for i in 0..50 {
            backing.write_batch(&[put("k", &format!("value-{}", i))]).unwrap();
        }
        let reclaimed = backing.compact().unwrap();

        assert!(reclaimed > 0);
        assert_eq!(backing.get(b"k").unwrap(), Some(b"value-49".to_vec()));

        drop(backing);
        let reopened = FileBacking::open("t", &path, 16, 1).unwrap();
        assert_eq!(reopened.get(b"k").unwrap(), Some(b"value-49".to_vec()));
    }

    #[test]
    fn test_large_batch_spans_frames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.ckv");
        let batch: Vec<_> = (0..20)
            .map(|i| put(&format!("key-{:02}", i), &format!("value-{:02}", i)))
            .collect();

        {
            let backing = FileBacking::open("t", &path, 4, 1)
                .unwrap()
                .with_frame_limit(64);
            backing.write_batch(&batch).unwrap();
            assert_eq!(backing.get(b"key-07").unwrap(), Some(b"value-07".to_vec()));
        }

        let reopened = FileBacking::open("t", &path, 4, 1).unwrap();
        assert_eq!(reopened.size().unwrap(), 20);
        assert_eq!(reopened.get(b"key-19").unwrap(), Some(b"value-19".to_vec()));
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let dir = TempDir::new().unwrap();
        let backing = FileBacking::open("t", dir.path().join("t.ckv"), 4, 1)
            .unwrap()
            .with_frame_limit(64);
        let size = backing.file_size();

        let result = backing.write_batch(&[put("a", "1"), put("big", &"x".repeat(100))]);
        assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
        assert_eq!(backing.file_size(), size);
        assert_eq!(backing.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_provider_rejects_path_names() {
        let dir = TempDir::new().unwrap();
        let provider = FileProvider::new(dir.path(), 16, 1);
        assert!(provider.open("../escape").is_err());
        assert!(provider.open("account").is_ok());
    }
}
