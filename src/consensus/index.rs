//! Fork-aware chain index
//!
//! Keeps every known branch above the current root, whatever order records
//! arrive in. Two maps describe the forest and are only ever updated
//! together:
//!
//! * `branches`: tip -> full path from the tip's base up to the tip
//! * `tips_by_base`: base -> every tip whose path starts at that base
//!
//! A base is a hash with no record in the index: either the root (the last
//! archived block) or the missing parent of an orphaned branch.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use thiserror::Error;
use crate::constants::DEFAULT_MAX_DISCARDED_HASHES;
use crate::crypto::Hash;
use super::{ChainRecord, RecordStore, Work};

/// Chain index errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("record {0} names itself as parent")]
    SelfParent(Hash),
    #[error("record {0} would close a cycle")]
    Cycle(Hash),
    #[error("unknown hash {0}")]
    UnknownHash(Hash),
    #[error("{0} is not on the canonical path")]
    NotOnCanonicalPath(Hash),
    #[error("{0} and {1} do not descend from the same base")]
    DisjointBranches(Hash, Hash),
}

/// Distance and cumulative work of a block, measured from the base its
/// branch terminates at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ancestry {
    /// Number of records between the base (exclusive) and the block (inclusive)
    pub distance: u64,
    /// Sum of the work of those records
    pub work: Work,
    /// Root or orphan boundary the measurement starts from
    pub base: Hash,
}

impl Ancestry {
    fn at_base(base: Hash) -> Self {
        Self {
            distance: 0,
            work: 0,
            base,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Memo {
    ancestry: Ancestry,
    epoch: u64,
}

/// Result of an `insert` call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InsertSummary {
    /// Hashes newly added, in insertion order
    pub inserted: Vec<Hash>,
    /// Records already present in the index
    pub duplicates: usize,
    /// Records refused, with the reason
    pub rejected: Vec<(Hash, IndexError)>,
    /// Records dropped because they build on a discarded or settled block
    pub discarded: usize,
}

/// Path change between two tips
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDiff {
    /// Last block shared by both tips
    pub ancestor: Hash,
    /// Distance of the ancestor from the base
    pub ancestor_distance: u64,
    /// New tip down to, excluding, the ancestor
    pub to_add: Vec<Hash>,
    /// Old tip down to, excluding, the ancestor
    pub to_remove: Vec<Hash>,
}

impl ChainDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Bounded set of hashes that can never join the canonical chain again.
/// The oldest entries are forgotten first.
#[derive(Debug)]
struct DiscardedSet {
    hashes: HashSet<Hash>,
    order: VecDeque<Hash>,
    capacity: usize,
}

impl DiscardedSet {
    fn new(capacity: usize) -> Self {
        Self {
            hashes: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, hash: Hash) {
        if self.capacity == 0 || !self.hashes.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.hashes.remove(&old);
            }
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }
}

/// Forest of unsettled branches above a single root
#[derive(Debug)]
pub struct ChainIndex {
    store: RecordStore,
    root: Hash,
    branches: HashMap<Hash, VecDeque<Hash>>,
    tips_by_base: HashMap<Hash, HashSet<Hash>>,
    /// Root-connected tip -> order in which it became connected
    connected: HashMap<Hash, u64>,
    next_connection: u64,
    discarded: DiscardedSet,
    memo: Mutex<HashMap<Hash, Memo>>,
    /// Bumped on every rebase; memo entries from older epochs are stale
    epoch: u64,
}

impl ChainIndex {
    /// Create an empty index anchored at `root`
    pub fn new(root: Hash) -> Self {
        Self {
            store: RecordStore::new(),
            root,
            branches: HashMap::new(),
            tips_by_base: HashMap::new(),
            connected: HashMap::new(),
            next_connection: 0,
            discarded: DiscardedSet::new(DEFAULT_MAX_DISCARDED_HASHES),
            memo: Mutex::new(HashMap::new()),
            epoch: 0,
        }
    }

    /// Number of discarded hashes remembered to refuse their descendants
    pub fn with_discard_capacity(mut self, capacity: usize) -> Self {
        self.discarded = DiscardedSet::new(capacity);
        self
    }

    /// True if `hash` was settled below the root or discarded with a dead
    /// fork, and is still remembered
    pub fn is_discarded(&self, hash: &Hash) -> bool {
        self.discarded.contains(hash)
    }

    /// Mark `hash` as never joining the chain. Orphan branches waiting on it
    /// are dropped and their records marked too. Returns how many records
    /// were dropped.
    pub fn discard(&mut self, hash: Hash) -> usize {
        if hash == self.root {
            return 0;
        }
        self.discarded.insert(hash);
        let tips = match self.tips_by_base.get(&hash) {
            Some(tips) => tips.clone(),
            None => return 0,
        };
        let members = self.members(&tips);
        self.drop_base(&hash);
        for h in &members {
            self.discarded.insert(*h);
        }
        log::debug!("discarded {} orphans waiting on {}", members.len(), hash.short());
        members.len()
    }

    /// Current root
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Number of unsettled records
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.store.contains(hash)
    }

    pub fn record(&self, hash: &Hash) -> Option<&ChainRecord> {
        self.store.record(hash)
    }

    pub fn parent_of(&self, hash: &Hash) -> Option<Hash> {
        self.store.parent_of(hash)
    }

    /// Insert records in any order.
    ///
    /// Known hashes are skipped. Malformed records are rejected one by one
    /// without affecting the rest of the batch.
    pub fn insert<I>(&mut self, records: I) -> InsertSummary
    where
        I: IntoIterator<Item = ChainRecord>,
    {
        let mut summary = InsertSummary::default();
        for record in records {
            if record.hash == self.root || self.store.contains(&record.hash) {
                summary.duplicates += 1;
                continue;
            }
            if self.discarded.contains(&record.hash) || self.discarded.contains(&record.parent_hash) {
                summary.discarded += 1 + self.discard(record.hash);
                continue;
            }
            match self.meld(record) {
                Ok(()) => summary.inserted.push(record.hash),
                Err(e) => {
                    log::debug!("rejected record {}: {}", record.hash.short(), e);
                    summary.rejected.push((record.hash, e));
                }
            }
        }
        if !summary.inserted.is_empty() {
            log::debug!(
                "melded {} records ({} duplicates, {} rejected), {} tips, {} bases",
                summary.inserted.len(),
                summary.duplicates,
                summary.rejected.len(),
                self.branches.len(),
                self.tips_by_base.len()
            );
        }
        summary
    }

    fn meld(&mut self, record: ChainRecord) -> Result<(), IndexError> {
        let hash = record.hash;
        let parent = record.parent_hash;
        if record.is_self_parented() {
            return Err(IndexError::SelfParent(hash));
        }

        // Path from the base up to and including the new record
        let parent_base = self.branches.get(&parent).and_then(|path| path.front().copied());
        let ancestry = if let Some(parent_base) = parent_base {
            // Parent is a tip: extend its branch in place
            if parent_base == hash {
                return Err(IndexError::Cycle(hash));
            }
            let mut path = self.branches.remove(&parent).unwrap_or_default();
            if let Some(tips) = self.tips_by_base.get_mut(&parent_base) {
                tips.remove(&parent);
            }
            self.connected.remove(&parent);
            path.push_back(hash);
            path
        } else {
            let mut upward = vec![hash];
            let mut cursor = parent;
            while let Some(next) = self.store.parent_of(&cursor) {
                upward.push(cursor);
                cursor = next;
            }
            if cursor == hash {
                return Err(IndexError::Cycle(hash));
            }
            upward.push(cursor);
            upward.into_iter().rev().collect::<VecDeque<_>>()
        };

        let base = ancestry.front().copied().unwrap_or(parent);
        self.store.insert(record);
        log::trace!("meld {} onto base {} at depth {}", hash.short(), base.short(), ancestry.len() - 1);

        let new_tips: Vec<Hash> = match self.tips_by_base.remove(&hash) {
            // The record was the missing parent of orphaned branches: splice
            // the new ancestry under each of them.
            Some(orphaned_tips) => {
                let base_tips = self.tips_by_base.entry(base).or_default();
                for tip in &orphaned_tips {
                    if let Some(path) = self.branches.get_mut(tip) {
                        path.pop_front();
                        for h in ancestry.iter().rev() {
                            path.push_front(*h);
                        }
                    }
                    base_tips.insert(*tip);
                }
                orphaned_tips.into_iter().collect()
            }
            None => {
                self.branches.insert(hash, ancestry);
                self.tips_by_base.entry(base).or_default().insert(hash);
                vec![hash]
            }
        };

        // Ties on work go to the tip that reached the root first
        if base == self.root {
            for tip in new_tips {
                self.connected.insert(tip, self.next_connection);
            }
            self.next_connection += 1;
        }
        Ok(())
    }

    /// Distance and cumulative work of `hash` from its base.
    ///
    /// Memoized; an entry is reused only while its base is still a base
    /// and no rebase happened since it was computed.
    pub fn work_and_distance(&self, hash: &Hash) -> Option<Ancestry> {
        if !self.store.contains(hash) {
            if *hash == self.root || self.tips_by_base.contains_key(hash) {
                return Some(Ancestry::at_base(*hash));
            }
            return None;
        }

        let mut memo = self.memo.lock();
        let mut pending = Vec::new();
        let mut cursor = *hash;
        let start = loop {
            if let Some(m) = memo.get(&cursor) {
                if m.epoch == self.epoch && !self.store.contains(&m.ancestry.base) {
                    break m.ancestry;
                }
            }
            match self.store.record(&cursor) {
                Some(record) => {
                    pending.push((cursor, record.work));
                    cursor = record.parent_hash;
                }
                None => break Ancestry::at_base(cursor),
            }
        };

        let mut current = start;
        for (h, work) in pending.into_iter().rev() {
            current = Ancestry {
                distance: current.distance + 1,
                work: current.work.saturating_add(work),
                base: current.base,
            };
            memo.insert(
                h,
                Memo {
                    ancestry: current,
                    epoch: self.epoch,
                },
            );
        }
        Some(current)
    }

    /// Root-connected tip with the most cumulative work.
    ///
    /// Equal work goes to the tip that was connected to the root first, then
    /// to the earlier arrival. Returns the root when nothing is connected.
    pub fn canonical_tip(&self) -> Hash {
        let tips = match self.tips_by_base.get(&self.root) {
            Some(tips) => tips,
            None => return self.root,
        };
        tips.iter()
            .filter_map(|tip| {
                let work = self.work_and_distance(tip)?.work;
                let seq = self.store.seq_of(tip)?;
                let connection = self.connected.get(tip).copied().unwrap_or(u64::MAX);
                Some(((work, Reverse(connection), Reverse(seq)), *tip))
            })
            .max_by_key(|(key, _)| *key)
            .map(|(_, tip)| tip)
            .unwrap_or(self.root)
    }

    /// Canonical chain from the first block above the root up to the
    /// canonical tip. Empty when nothing is connected.
    pub fn canonical_path(&self) -> Vec<Hash> {
        let tip = self.canonical_tip();
        match self.branches.get(&tip) {
            Some(path) => path.iter().skip(1).copied().collect(),
            None => Vec::new(),
        }
    }

    /// Compute the path change from `old_tip` to `new_tip`.
    pub fn diff(&self, old_tip: &Hash, new_tip: &Hash) -> Result<ChainDiff, IndexError> {
        let old = self
            .work_and_distance(old_tip)
            .ok_or(IndexError::UnknownHash(*old_tip))?;
        let new = self
            .work_and_distance(new_tip)
            .ok_or(IndexError::UnknownHash(*new_tip))?;
        if old.base != new.base {
            return Err(IndexError::DisjointBranches(*old_tip, *new_tip));
        }

        let (mut a, mut da) = (*old_tip, old.distance);
        let (mut b, mut db) = (*new_tip, new.distance);
        let mut to_remove = Vec::new();
        let mut to_add = Vec::new();
        while a != b {
            if da == 0 && db == 0 {
                return Err(IndexError::DisjointBranches(*old_tip, *new_tip));
            }
            if da > db {
                to_remove.push(a);
                a = self.store.parent_of(&a).ok_or(IndexError::UnknownHash(a))?;
                da -= 1;
            } else {
                to_add.push(b);
                b = self.store.parent_of(&b).ok_or(IndexError::UnknownHash(b))?;
                db -= 1;
            }
        }

        Ok(ChainDiff {
            ancestor: a,
            ancestor_distance: da,
            to_add,
            to_remove,
        })
    }

    /// Make `new_root` the root.
    ///
    /// Records from the old root up to `new_root` are dropped, as is every
    /// branch forking off below `new_root`. Returns the number of fork
    /// records discarded. Fails without touching anything unless `new_root`
    /// lies on the canonical path.
    pub fn rebase(&mut self, new_root: &Hash) -> Result<usize, IndexError> {
        if *new_root == self.root {
            return Ok(0);
        }
        let canonical = self.canonical_tip();
        let settled_prefix: Vec<Hash> = self
            .branches
            .get(&canonical)
            .and_then(|path| {
                let depth = path.iter().position(|h| h == new_root)?;
                Some(path.iter().take(depth + 1).copied().collect())
            })
            .filter(|prefix: &Vec<Hash>| prefix.len() > 1)
            .ok_or(IndexError::NotOnCanonicalPath(*new_root))?;
        let depth = settled_prefix.len() - 1;

        let old_root = self.root;
        self.discarded.insert(old_root);
        let mut settled = 0usize;
        for h in settled_prefix.iter().skip(1) {
            if self.store.remove(h).is_some() {
                settled += 1;
            }
            if h != new_root {
                self.discarded.insert(*h);
            }
        }

        let mut discarded = 0usize;
        let mut survivors = HashSet::new();
        let tips = self.tips_by_base.remove(&old_root).unwrap_or_default();
        for tip in tips {
            let mut path = match self.branches.remove(&tip) {
                Some(path) => path,
                None => continue,
            };
            if path.get(depth) == Some(new_root) {
                path.drain(..depth);
                // A tip at the new root itself simply becomes the root
                if path.len() > 1 {
                    self.branches.insert(tip, path);
                    survivors.insert(tip);
                } else {
                    self.connected.remove(&tip);
                }
            } else {
                self.connected.remove(&tip);
                for (i, h) in path.iter().enumerate().skip(1) {
                    if settled_prefix.get(i) == Some(h) {
                        continue;
                    }
                    if self.store.remove(h).is_some() {
                        discarded += 1;
                    }
                    self.discarded.insert(*h);
                }
            }
        }
        if !survivors.is_empty() {
            self.tips_by_base.insert(*new_root, survivors);
        }

        self.root = *new_root;
        self.epoch += 1;
        self.memo.lock().clear();
        log::debug!(
            "rebased from {} to {}: {} settled, {} fork records discarded",
            old_root.short(),
            new_root.short(),
            settled,
            discarded
        );
        Ok(discarded)
    }

    /// Orphan boundaries: missing parents that keep branches from reaching
    /// the root.
    pub fn missing_parents(&self) -> BTreeSet<Hash> {
        self.tips_by_base
            .keys()
            .filter(|base| **base != self.root && !self.discarded.contains(base))
            .copied()
            .collect()
    }

    /// Drop orphan branches, oldest first, until at most `max_records`
    /// orphan records remain. Returns the evicted boundaries.
    pub fn prune_orphans(&mut self, max_records: usize) -> Vec<Hash> {
        let mut groups: Vec<(u64, Hash, usize)> = self
            .tips_by_base
            .iter()
            .filter(|(base, _)| **base != self.root)
            .map(|(base, tips)| {
                let members = self.members(tips);
                let oldest = members
                    .iter()
                    .filter_map(|h| self.store.seq_of(h))
                    .min()
                    .unwrap_or(u64::MAX);
                (oldest, *base, members.len())
            })
            .collect();
        let mut total: usize = groups.iter().map(|(_, _, n)| n).sum();
        if total <= max_records {
            return Vec::new();
        }

        groups.sort();
        let mut evicted = Vec::new();
        for (_, base, size) in groups {
            if total <= max_records {
                break;
            }
            self.drop_base(&base);
            total -= size;
            evicted.push(base);
        }
        log::info!("evicted {} orphan groups, {} orphan records remain", evicted.len(), total);
        evicted
    }

    fn members(&self, tips: &HashSet<Hash>) -> HashSet<Hash> {
        tips.iter()
            .filter_map(|tip| self.branches.get(tip))
            .flat_map(|path| path.iter().skip(1).copied())
            .collect()
    }

    fn drop_base(&mut self, base: &Hash) {
        let tips = self.tips_by_base.remove(base).unwrap_or_default();
        let mut memo = self.memo.lock();
        for tip in tips {
            self.connected.remove(&tip);
            if let Some(path) = self.branches.remove(&tip) {
                for h in path.iter().skip(1) {
                    self.store.remove(h);
                    memo.remove(h);
                }
            }
        }
    }

    /// Current tips, with the base each one descends from
    pub fn tips(&self) -> Vec<(Hash, Hash)> {
        self.tips_by_base
            .iter()
            .flat_map(|(base, tips)| tips.iter().map(move |tip| (*tip, *base)))
            .collect()
    }

    /// Copy of the tip -> path map, each path ordered tip first
    pub fn branch_map(&self) -> BTreeMap<Hash, Vec<Hash>> {
        self.branches
            .iter()
            .map(|(tip, path)| (*tip, path.iter().rev().copied().collect()))
            .collect()
    }

    /// Copy of the base -> tips map
    pub fn tip_map(&self) -> BTreeMap<Hash, BTreeSet<Hash>> {
        self.tips_by_base
            .iter()
            .map(|(base, tips)| (*base, tips.iter().copied().collect()))
            .collect()
    }

    /// Check that both forest maps agree and every path is properly linked
    pub fn is_consistent(&self) -> bool {
        let listed: usize = self.tips_by_base.values().map(|t| t.len()).sum();
        if listed != self.branches.len() {
            return false;
        }
        for (base, tips) in &self.tips_by_base {
            if self.store.contains(base) {
                return false;
            }
            for tip in tips {
                let path = match self.branches.get(tip) {
                    Some(path) => path,
                    None => return false,
                };
                if path.front() != Some(base) || path.back() != Some(tip) || path.len() < 2 {
                    return false;
                }
                for (lower, upper) in path.iter().zip(path.iter().skip(1)) {
                    if self.store.parent_of(upper) != Some(*lower) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u64) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        bytes[31] = 0xff;
        Hash(bytes)
    }

    fn root() -> Hash {
        Hash([0xaa; 32])
    }

    /// Blocks 0..n in a line above the root, `work` each
    fn line(n: u64, work: Work) -> Vec<ChainRecord> {
        (0..n)
            .map(|i| {
                let parent = if i == 0 { root() } else { h(i - 1) };
                ChainRecord::new(h(i), parent, work)
            })
            .collect()
    }

    #[test]
    fn test_empty_index() {
        let index = ChainIndex::new(root());
        assert_eq!(index.canonical_tip(), root());
        assert!(index.canonical_path().is_empty());
        assert!(index.missing_parents().is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_linear_chain() {
        let mut index = ChainIndex::new(root());
        let summary = index.insert(line(5, 10));
        assert_eq!(summary.inserted.len(), 5);
        assert_eq!(index.canonical_tip(), h(4));

        let a = index.work_and_distance(&h(4)).unwrap();
        assert_eq!(a.distance, 5);
        assert_eq!(a.work, 50);
        assert_eq!(a.base, root());
        assert_eq!(index.canonical_path(), (0..5).map(h).collect::<Vec<_>>());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_reverse_order_insert_connects() {
        let mut index = ChainIndex::new(root());
        let mut records = line(6, 1);
        records.reverse();
        for r in records {
            index.insert([r]);
            assert!(index.is_consistent());
        }
        assert_eq!(index.canonical_tip(), h(5));
        assert!(index.missing_parents().is_empty());
        assert_eq!(index.branch_map().len(), 1);
    }

    #[test]
    fn test_orphans_report_missing_parents() {
        let mut index = ChainIndex::new(root());
        let records = line(10, 1);
        index.insert(records[..3].iter().copied());
        index.insert(records[6..].iter().copied());
        assert_eq!(index.canonical_tip(), h(2));
        assert_eq!(index.missing_parents(), [h(5)].into_iter().collect::<BTreeSet<_>>());

        index.insert(records[3..6].iter().copied());
        assert_eq!(index.canonical_tip(), h(9));
        assert!(index.missing_parents().is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_orphan_work_is_measured_from_boundary() {
        let mut index = ChainIndex::new(root());
        index.insert([ChainRecord::new(h(7), h(6), 3), ChainRecord::new(h(8), h(7), 3)]);
        let a = index.work_and_distance(&h(8)).unwrap();
        assert_eq!(a.base, h(6));
        assert_eq!(a.distance, 2);
        // Not connected, so the root remains canonical
        assert_eq!(index.canonical_tip(), root());
    }

    #[test]
    fn test_memo_refreshes_when_orphan_resolves() {
        let mut index = ChainIndex::new(root());
        index.insert([ChainRecord::new(h(1), h(0), 4)]);
        assert_eq!(index.work_and_distance(&h(1)).unwrap().base, h(0));

        index.insert([ChainRecord::new(h(0), root(), 4)]);
        let a = index.work_and_distance(&h(1)).unwrap();
        assert_eq!(a.base, root());
        assert_eq!(a.work, 8);
        assert_eq!(a.distance, 2);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut index = ChainIndex::new(root());
        index.insert(line(3, 1));
        let before = index.branch_map();
        let summary = index.insert(line(3, 1));
        assert!(summary.inserted.is_empty());
        assert_eq!(summary.duplicates, 3);
        assert_eq!(index.branch_map(), before);
        assert_eq!(index.canonical_tip(), h(2));
    }

    #[test]
    fn test_self_parent_rejected() {
        let mut index = ChainIndex::new(root());
        let summary = index.insert([
            ChainRecord::new(h(5), h(5), 1),
            ChainRecord::new(h(0), root(), 1),
        ]);
        assert_eq!(summary.rejected, vec![(h(5), IndexError::SelfParent(h(5)))]);
        assert_eq!(summary.inserted, vec![h(0)]);
        assert!(!index.contains(&h(5)));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut index = ChainIndex::new(root());
        index.insert([ChainRecord::new(h(1), h(2), 1)]);
        let summary = index.insert([ChainRecord::new(h(2), h(1), 1)]);
        assert_eq!(summary.rejected, vec![(h(2), IndexError::Cycle(h(2)))]);
        assert!(index.is_consistent());

        // Longer cycle through the middle of a branch
        let mut index = ChainIndex::new(root());
        index.insert([
            ChainRecord::new(h(1), h(3), 1),
            ChainRecord::new(h(2), h(1), 1),
            ChainRecord::new(h(9), h(2), 1),
        ]);
        let summary = index.insert([ChainRecord::new(h(3), h(2), 1)]);
        assert_eq!(summary.rejected, vec![(h(3), IndexError::Cycle(h(3)))]);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_heavier_fork_wins_and_diff() {
        let mut index = ChainIndex::new(root());
        index.insert(line(5, 10));
        assert_eq!(index.canonical_tip(), h(4));

        index.insert([
            ChainRecord::new(h(100), h(2), 15),
            ChainRecord::new(h(101), h(100), 15),
        ]);
        assert_eq!(index.canonical_tip(), h(101));

        let diff = index.diff(&h(4), &h(101)).unwrap();
        assert_eq!(diff.to_remove, vec![h(4), h(3)]);
        assert_eq!(diff.to_add, vec![h(101), h(100)]);
        assert_eq!(diff.ancestor, h(2));
        assert_eq!(diff.ancestor_distance, 3);
    }

    #[test]
    fn test_equal_work_first_seen_wins() {
        let mut index = ChainIndex::new(root());
        index.insert(line(3, 10));
        index.insert([ChainRecord::new(h(50), h(1), 10)]);
        assert_eq!(index.canonical_tip(), h(2));

        // Another equal-work tip arriving later does not flip the choice
        index.insert([ChainRecord::new(h(51), h(1), 10)]);
        assert_eq!(index.canonical_tip(), h(2));
    }

    #[test]
    fn test_diff_from_root() {
        let mut index = ChainIndex::new(root());
        index.insert(line(3, 1));
        let diff = index.diff(&root(), &h(2)).unwrap();
        assert!(diff.to_remove.is_empty());
        assert_eq!(diff.to_add, vec![h(2), h(1), h(0)]);
        assert_eq!(diff.ancestor, root());
    }

    #[test]
    fn test_diff_disjoint_branches() {
        let mut index = ChainIndex::new(root());
        index.insert(line(3, 1));
        index.insert([ChainRecord::new(h(20), h(19), 1)]);
        assert_eq!(
            index.diff(&h(2), &h(20)),
            Err(IndexError::DisjointBranches(h(2), h(20)))
        );
        assert_eq!(index.diff(&h(2), &h(77)), Err(IndexError::UnknownHash(h(77))));
    }

    #[test]
    fn test_rebase_drops_settled_and_dead_forks() {
        let mut index = ChainIndex::new(root());
        index.insert(line(6, 10));
        // fork below the future root, and one above it
        index.insert([ChainRecord::new(h(200), h(0), 1)]);
        index.insert([ChainRecord::new(h(300), h(3), 1)]);

        let discarded = index.rebase(&h(2)).unwrap();
        assert_eq!(discarded, 1);
        assert_eq!(index.root(), h(2));
        assert!(!index.contains(&h(0)));
        assert!(!index.contains(&h(2)));
        assert!(!index.contains(&h(200)));
        assert!(index.contains(&h(300)));
        assert_eq!(index.canonical_tip(), h(5));
        assert_eq!(index.canonical_path(), vec![h(3), h(4), h(5)]);

        let a = index.work_and_distance(&h(5)).unwrap();
        assert_eq!(a.distance, 3);
        assert_eq!(a.work, 30);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_rebase_to_tip_empties_index() {
        let mut index = ChainIndex::new(root());
        index.insert(line(3, 1));
        index.rebase(&h(2)).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.canonical_tip(), h(2));
        assert!(index.is_consistent());

        index.insert([ChainRecord::new(h(3), h(2), 1)]);
        assert_eq!(index.canonical_tip(), h(3));
    }

    #[test]
    fn test_rebase_to_non_ancestor_rejected() {
        let mut index = ChainIndex::new(root());
        index.insert(line(5, 10));
        index.insert([ChainRecord::new(h(100), h(1), 1)]);
        let before = index.branch_map();

        assert_eq!(index.rebase(&h(100)), Err(IndexError::NotOnCanonicalPath(h(100))));
        assert_eq!(index.rebase(&h(999)), Err(IndexError::NotOnCanonicalPath(h(999))));
        assert_eq!(index.root(), root());
        assert_eq!(index.branch_map(), before);
    }

    #[test]
    fn test_prune_orphans_oldest_first() {
        let mut index = ChainIndex::new(root());
        index.insert(line(2, 1));
        index.insert([ChainRecord::new(h(10), h(9), 1), ChainRecord::new(h(11), h(10), 1)]);
        index.insert([ChainRecord::new(h(20), h(19), 1)]);
        assert_eq!(index.missing_parents().len(), 2);

        assert!(index.prune_orphans(3).is_empty());
        let evicted = index.prune_orphans(1);
        assert_eq!(evicted, vec![h(9)]);
        assert_eq!(index.missing_parents(), [h(19)].into_iter().collect::<BTreeSet<_>>());
        assert!(!index.contains(&h(10)));
        assert!(index.contains(&h(1)));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_overflowing_work_saturates() {
        let mut index = ChainIndex::new(root());
        index.insert([
            ChainRecord::new(h(0), root(), Work::MAX),
            ChainRecord::new(h(1), h(0), 2),
        ]);
        let a = index.work_and_distance(&h(1)).unwrap();
        assert_eq!(a.work, Work::MAX);
        assert_eq!(a.distance, 2);
        assert_eq!(index.canonical_tip(), h(1));
    }

    #[test]
    fn test_equal_work_late_connection_keeps_tip() {
        let mut index = ChainIndex::new(root());
        // Orphan seen first, connected only after a competing tip
        index.insert([ChainRecord::new(h(11), h(10), 10)]);
        index.insert([ChainRecord::new(h(1), root(), 20)]);
        assert_eq!(index.canonical_tip(), h(1));

        index.insert([ChainRecord::new(h(10), root(), 10)]);
        assert_eq!(index.work_and_distance(&h(11)).unwrap().work, 20);
        assert_eq!(index.canonical_tip(), h(1));

        // More work still wins
        index.insert([ChainRecord::new(h(12), h(11), 1)]);
        assert_eq!(index.canonical_tip(), h(12));
    }

    #[test]
    fn test_children_of_discarded_blocks_are_dropped() {
        let mut index = ChainIndex::new(root());
        index.insert(line(6, 10));
        index.insert([ChainRecord::new(h(200), h(0), 1)]);
        index.rebase(&h(2)).unwrap();
        assert!(index.is_discarded(&h(200)));
        assert!(index.is_discarded(&h(1)));
        assert!(!index.is_discarded(&h(2)));

        // Builds on a dead fork, on a settled block, on the old root
        let summary = index.insert([
            ChainRecord::new(h(201), h(200), 50),
            ChainRecord::new(h(202), h(201), 50),
            ChainRecord::new(h(210), h(1), 50),
            ChainRecord::new(h(220), root(), 50),
        ]);
        assert_eq!(summary.discarded, 4);
        assert!(summary.inserted.is_empty());
        assert!(index.missing_parents().is_empty());
        assert_eq!(index.len(), 3);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_discard_drops_waiting_orphans() {
        let mut index = ChainIndex::new(root());
        index.insert(line(2, 1));
        index.insert([ChainRecord::new(h(31), h(30), 1), ChainRecord::new(h(32), h(31), 1)]);
        assert_eq!(index.missing_parents(), [h(30)].into_iter().collect::<BTreeSet<_>>());

        assert_eq!(index.discard(h(30)), 2);
        assert!(index.missing_parents().is_empty());
        assert!(!index.contains(&h(32)));
        assert!(index.is_discarded(&h(32)));

        // A late child of a dropped orphan is refused too
        let summary = index.insert([ChainRecord::new(h(33), h(32), 1)]);
        assert_eq!(summary.discarded, 1);
        assert!(index.missing_parents().is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_discard_capacity_forgets_oldest() {
        let mut index = ChainIndex::new(root()).with_discard_capacity(2);
        index.discard(h(1));
        index.discard(h(2));
        index.discard(h(3));
        assert!(!index.is_discarded(&h(1)));
        assert!(index.is_discarded(&h(2)));
        assert!(index.is_discarded(&h(3)));
    }
}
