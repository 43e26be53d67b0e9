//! Chain records and the record store
//!
//! A `ChainRecord` is the only thing the chain index knows about a block:
//! its hash, its parent and how much work it contributes. Header decoding
//! and proof-of-work checks happen before a record is built.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use crate::crypto::Hash;

/// Amount of proof-of-work, per block or cumulative
pub type Work = u128;

/// Immutable metadata of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    /// Hash of this block
    pub hash: Hash,
    /// Hash of the block this one extends
    pub parent_hash: Hash,
    /// Work contributed by this block alone
    pub work: Work,
}

impl ChainRecord {
    /// Create a new chain record
    pub fn new(hash: Hash, parent_hash: Hash, work: Work) -> Self {
        Self {
            hash,
            parent_hash,
            work,
        }
    }

    /// A record naming itself as parent can never be linked
    pub fn is_self_parented(&self) -> bool {
        self.hash == self.parent_hash
    }
}

/// A record together with the order in which it first arrived
#[derive(Debug, Clone, Copy)]
struct StoredRecord {
    pub record: ChainRecord,
    /// Arrival sequence number, strictly increasing across inserts
    pub seq: u64,
}

/// Hash -> record mapping for every unsettled block
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<Hash, StoredRecord>,
    next_seq: u64,
}

impl RecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning its arrival sequence number.
    ///
    /// Returns `None` if the hash is already present; the stored record is
    /// left untouched.
    pub fn insert(&mut self, record: ChainRecord) -> Option<u64> {
        if self.records.contains_key(&record.hash) {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(record.hash, StoredRecord { record, seq });
        Some(seq)
    }

    pub fn record(&self, hash: &Hash) -> Option<&ChainRecord> {
        self.records.get(hash).map(|s| &s.record)
    }

    pub fn parent_of(&self, hash: &Hash) -> Option<Hash> {
        self.records.get(hash).map(|s| s.record.parent_hash)
    }

    pub fn seq_of(&self, hash: &Hash) -> Option<u64> {
        self.records.get(hash).map(|s| s.seq)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.records.contains_key(hash)
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<ChainRecord> {
        self.records.remove(hash).map(|s| s.record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> Hash {
        Hash([n; 32])
    }

    #[test]
    fn test_insert_assigns_increasing_seq() {
        let mut store = RecordStore::new();
        assert_eq!(store.insert(ChainRecord::new(h(1), h(0), 1)), Some(0));
        assert_eq!(store.insert(ChainRecord::new(h(2), h(1), 1)), Some(1));
        assert_eq!(store.len(), 2);
        assert_eq!(store.seq_of(&h(2)), Some(1));
    }

    #[test]
    fn test_duplicate_insert_keeps_original() {
        let mut store = RecordStore::new();
        store.insert(ChainRecord::new(h(1), h(0), 5));
        assert_eq!(store.insert(ChainRecord::new(h(1), h(9), 7)), None);
        assert_eq!(store.parent_of(&h(1)), Some(h(0)));
        assert_eq!(store.record(&h(1)).map(|r| r.work), Some(5));
    }

    #[test]
    fn test_remove() {
        let mut store = RecordStore::new();
        store.insert(ChainRecord::new(h(1), h(0), 5));
        assert!(store.remove(&h(1)).is_some());
        assert!(!store.contains(&h(1)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_self_parented() {
        assert!(ChainRecord::new(h(3), h(3), 1).is_self_parented());
        assert!(!ChainRecord::new(h(3), h(2), 1).is_self_parented());
    }
}
