//! Petrified block archive
//!
//! Append-only sequence of settled block hashes. Position in the sequence is
//! the block index; the last hash is the root the chain index builds on
//! (the anchor while nothing has been archived yet).
//!
//! Persistence uses a single sled tree so that hashes and metadata of one
//! append land in the same atomic batch.

use sled::{Batch, Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use crate::consensus::{ChainRecord, Work};
use crate::crypto::{Hash, HASH_LEN};

const TREE_NAME: &str = "archive";
const HASH_PREFIX: u8 = b'h';
const ANCHOR_KEY: &[u8] = b"meta:anchor";
const ROOT_WORK_KEY: &[u8] = b"meta:root_work";

/// Archive errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("records do not extend the archive: expected parent {expected}, found {found}")]
    NotContiguous { expected: Hash, found: Hash },
    #[error("record {position} of the batch does not link to its predecessor")]
    NotLinked { position: usize },
    #[error("archive was created with anchor {stored}, opened with {expected}")]
    AnchorMismatch { stored: Hash, expected: Hash },
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
}

#[derive(Debug, Clone)]
struct SledBackend {
    db: Db,
    tree: Tree,
}

/// Append-only store of settled block hashes
#[derive(Debug)]
pub struct ArchiveStore {
    anchor: Hash,
    hashes: Vec<Hash>,
    lookup: HashMap<Hash, u64>,
    /// Cumulative work up to and including the root
    root_work: Work,
    backend: Option<SledBackend>,
}

impl ArchiveStore {
    /// Create an archive held only in memory
    pub fn in_memory(anchor: Hash) -> Self {
        Self {
            anchor,
            hashes: Vec::new(),
            lookup: HashMap::new(),
            root_work: 0,
            backend: None,
        }
    }

    /// Open or create an archive on disk.
    ///
    /// Reopening replays the stored sequence; count and last hash are
    /// derived from it.
    pub fn open<P: AsRef<Path>>(path: P, anchor: Hash) -> Result<Self, ArchiveError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(TREE_NAME)?;

        match tree.get(ANCHOR_KEY)? {
            Some(stored) => {
                let stored = Hash::from_slice(&stored)
                    .ok_or_else(|| ArchiveError::Corrupt("bad anchor length".to_string()))?;
                if stored != anchor {
                    return Err(ArchiveError::AnchorMismatch {
                        stored,
                        expected: anchor,
                    });
                }
            }
            None => {
                tree.insert(ANCHOR_KEY, anchor.0.as_ref())?;
                db.flush()?;
            }
        }

        let root_work = match tree.get(ROOT_WORK_KEY)? {
            Some(bytes) => {
                let arr: [u8; 16] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| ArchiveError::Corrupt("bad root work length".to_string()))?;
                Work::from_le_bytes(arr)
            }
            None => 0,
        };

        let mut store = Self {
            anchor,
            hashes: Vec::new(),
            lookup: HashMap::new(),
            root_work,
            backend: None,
        };
        for item in tree.scan_prefix([HASH_PREFIX]) {
            let (key, value) = item?;
            let expected = store.hashes.len() as u64;
            if key.len() != 9 || decode_index(&key[1..]) != expected {
                return Err(ArchiveError::Corrupt(format!("gap before index {}", expected)));
            }
            let hash = Hash::from_slice(&value)
                .ok_or_else(|| ArchiveError::Corrupt(format!("bad hash at index {}", expected)))?;
            store.push(hash);
        }
        store.backend = Some(SledBackend { db, tree });

        log::debug!("archive reopened with {} hashes", store.count());
        if let Some((index, hash)) = store.last() {
            log::debug!("archive ends at {} ({})", index, hash.short());
        }
        Ok(store)
    }

    /// Rebuild an in-memory archive from a concatenation of 32-byte hashes.
    /// A trailing partial hash is ignored.
    pub fn replay(anchor: Hash, bytes: &[u8]) -> Self {
        let mut store = Self::in_memory(anchor);
        for chunk in bytes.chunks_exact(HASH_LEN) {
            if let Some(hash) = Hash::from_slice(chunk) {
                store.push(hash);
            }
        }
        store
    }

    /// Sequence of archived hashes as concatenated 32-byte values
    pub fn encode_hashes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.hashes.len() * HASH_LEN);
        for hash in &self.hashes {
            bytes.extend_from_slice(&hash.0);
        }
        bytes
    }

    fn push(&mut self, hash: Hash) {
        self.lookup.insert(hash, self.hashes.len() as u64);
        self.hashes.push(hash);
    }

    /// Check that `records` would extend the archive, without writing
    pub fn check_contiguous(&self, records: &[ChainRecord]) -> Result<(), ArchiveError> {
        let first = match records.first() {
            Some(first) => first,
            None => return Ok(()),
        };
        let root = self.root();
        if first.parent_hash != root {
            return Err(ArchiveError::NotContiguous {
                expected: root,
                found: first.parent_hash,
            });
        }
        for (position, pair) in records.windows(2).enumerate() {
            if pair[1].parent_hash != pair[0].hash {
                return Err(ArchiveError::NotLinked {
                    position: position + 1,
                });
            }
        }
        Ok(())
    }

    /// Append a linked sequence of records whose first parent is the
    /// current root. Nothing is written unless the whole batch is valid.
    pub fn append(&mut self, records: &[ChainRecord]) -> Result<(), ArchiveError> {
        self.check_contiguous(records)?;
        if records.is_empty() {
            return Ok(());
        }
        let root_work = records
            .iter()
            .fold(self.root_work, |acc, r| acc.saturating_add(r.work));

        if let Some(backend) = &self.backend {
            let mut batch = Batch::default();
            let start = self.hashes.len() as u64;
            for (offset, record) in records.iter().enumerate() {
                batch.insert(hash_key(start + offset as u64).to_vec(), record.hash.0.to_vec());
            }
            batch.insert(ROOT_WORK_KEY, root_work.to_le_bytes().to_vec());
            backend.tree.apply_batch(batch)?;
            backend.db.flush()?;
        }

        for record in records {
            self.push(record.hash);
        }
        self.root_work = root_work;
        Ok(())
    }

    /// Index and hash of the last archived block
    pub fn last(&self) -> Option<(u64, Hash)> {
        self.hashes
            .last()
            .map(|hash| (self.hashes.len() as u64 - 1, *hash))
    }

    /// Current root: the last archived hash, or the anchor
    pub fn root(&self) -> Hash {
        self.hashes.last().copied().unwrap_or(self.anchor)
    }

    /// Parent of the block at index 0
    pub fn anchor(&self) -> Hash {
        self.anchor
    }

    pub fn root_work(&self) -> Work {
        self.root_work
    }

    pub fn lookup(&self, hash: &Hash) -> Option<u64> {
        self.lookup.get(hash).copied()
    }

    pub fn by_index(&self, index: u64) -> Option<Hash> {
        self.hashes.get(usize::try_from(index).ok()?).copied()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.lookup.contains_key(hash)
    }

    pub fn count(&self) -> u64 {
        self.hashes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }
}

fn hash_key(index: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = HASH_PREFIX;
    key[1..].copy_from_slice(&index.to_be_bytes());
    key
}

fn decode_index(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(arr)
}
