//! Core types for the revoking store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version boundary shared by every chain. One epoch is one block's changes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Epoch(pub u64);

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Epoch(self.0 - 1))
        } else {
            None
        }
    }
}

/// Named read entry point into every chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    /// Live, mutable head.
    Head,
    /// Last block whose solidify threshold was reached.
    Solid,
    /// Last BFT-finalized block.
    Pbft,
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::Head
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Head => write!(f, "HEAD"),
            Cursor::Solid => write!(f, "SOLID"),
            Cursor::Pbft => write!(f, "PBFT"),
        }
    }
}

/// A decision recorded in a delta layer.
///
/// A tombstone is distinct from absence: it hides every ancestor's value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    Value(Vec<u8>),
    Tombstone,
}

impl Entry {
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Entry::Value(v) => Some(v),
            Entry::Tombstone => None,
        }
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Entry::Value(v) => Some(v),
            Entry::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Entry::Tombstone)
    }

    /// Approximate heap footprint.
    pub fn size(&self) -> usize {
        match self {
            Entry::Value(v) => v.len(),
            Entry::Tombstone => 0,
        }
    }
}

impl From<Option<Vec<u8>>> for Entry {
    fn from(value: Option<Vec<u8>>) -> Self {
        match value {
            Some(v) => Entry::Value(v),
            None => Entry::Tombstone,
        }
    }
}

/// Content digest of a merged view (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Digest of an ordered key/value sequence.
    ///
    /// Each pair is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
    pub fn of_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let mut hasher = Sha256::new();
        for (key, value) in pairs {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key);
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value);
        }
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Seconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Timestamp(secs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Per-store chain statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChainStats {
    pub name: String,
    /// Epoch currently represented by the root.
    pub root_epoch: Epoch,
    /// Epoch of the head layer.
    pub head_epoch: Epoch,
    /// Number of delta layers above the root.
    pub depth: usize,
    /// Entry count per delta layer, oldest first.
    pub layer_entries: Vec<usize>,
    /// Approximate bytes held in deltas.
    pub delta_bytes: usize,
}

/// Engine-wide statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineStats {
    pub store_count: usize,
    pub depth: usize,
    pub root_epoch: Epoch,
    pub head_epoch: Epoch,
    pub solid_marker: Option<Epoch>,
    pub pbft_marker: Option<Epoch>,
    pub chains: Vec<ChainStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let hash = Hash::from_bytes(b"hello world");
        let parsed = Hash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_pair_digest_is_length_prefixed() {
        let a = Hash::of_pairs([(&b"ab"[..], &b"c"[..])]);
        let b = Hash::of_pairs([(&b"a"[..], &b"bc"[..])]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_epoch_navigation() {
        let epoch = Epoch(5);
        assert_eq!(epoch.next(), Epoch(6));
        assert_eq!(epoch.prev(), Some(Epoch(4)));
        assert_eq!(Epoch(0).prev(), None);
    }

    #[test]
    fn test_entry_from_option() {
        assert_eq!(Entry::from(Some(b"x".to_vec())), Entry::Value(b"x".to_vec()));
        assert!(Entry::from(None).is_tombstone());
    }
}
