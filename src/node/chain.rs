//! Chain coordinator
//!
//! `Blockchain` owns the unsettled index, the petrified archive, the change
//! feed and a mirrored chain view. Every batch of records runs through one
//! pipeline: filter, insert, diff against the previous tip, publish,
//! mirror into the view, petrify.
//!
//! Block indices are absolute: the first block above the anchor is index 0,
//! archived blocks occupy `0..locked_length()`, and the unsettled canonical
//! path continues from there.

use crate::consensus::{
    maybe_petrify, Ancestry, ChainDiff, ChainIndex, ChainRecord, InsertSummary, PetrifyPolicy,
    SafetyMargin, Work,
};
use crate::crypto::Hash;
use crate::p2p::{locator_indices, ChainView, RetainPolicy, ViewTuple};
use crate::storage::ArchiveStore;
use std::collections::BTreeSet;
use super::{ChainConfig, ChainEvent, ChangeFeed, ConfigError, Subscription};

/// What one `add_records` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainUpdate {
    pub summary: InsertSummary,
    /// Records dropped before insertion: already archived, or building on
    /// an archived block other than the root
    pub settled: usize,
    /// Canonical changes published to subscribers
    pub events: Vec<ChainEvent>,
    /// Number of blocks moved into the archive
    pub petrified: usize,
    /// Orphan boundaries evicted to respect the size bound
    pub evicted: Vec<Hash>,
}

/// Fork-aware chain state with a petrified archive underneath
pub struct Blockchain {
    index: ChainIndex,
    archive: ArchiveStore,
    feed: ChangeFeed,
    view: ChainView,
    policy: Box<dyn PetrifyPolicy + Send + Sync>,
    config: ChainConfig,
    tip: Hash,
    /// Unsettled canonical path, oldest first
    path: Vec<Hash>,
    petrify_failures: u32,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("root", &self.index.root())
            .field("tip", &self.tip)
            .field("locked_length", &self.archive.count())
            .field("unsettled", &self.index.len())
            .finish()
    }
}

impl Blockchain {
    /// In-memory chain whose first block has parent `anchor`
    pub fn new(anchor: Hash, config: ChainConfig) -> Result<Self, ConfigError> {
        Self::with_archive(ArchiveStore::in_memory(anchor), config)
    }

    /// Chain resuming on top of an existing archive
    pub fn with_archive(archive: ArchiveStore, config: ChainConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let root = archive.root();
        let mut view = ChainView::new(archive.anchor()).with_dense_samples(config.locator_dense_samples);
        if let Some((index, hash)) = archive.last() {
            view.apply_change(
                index,
                [ViewTuple {
                    index,
                    hash,
                    work: archive.root_work(),
                }],
            );
        }
        let policy = SafetyMargin::new(config.petrify_margin).with_min_batch(config.petrify_min_batch);
        log::info!(
            "chain starting at root {} with {} archived blocks",
            root.short(),
            archive.count()
        );
        Ok(Self {
            index: ChainIndex::new(root).with_discard_capacity(config.max_discarded_hashes),
            archive,
            feed: ChangeFeed::new(),
            view,
            policy: Box::new(policy),
            config,
            tip: root,
            path: Vec::new(),
            petrify_failures: 0,
        })
    }

    /// Replace the petrify policy derived from the config
    pub fn with_policy<P>(mut self, policy: P) -> Self
    where
        P: PetrifyPolicy + Send + Sync + 'static,
    {
        self.policy = Box::new(policy);
        self
    }

    fn is_settled(&self, hash: &Hash) -> bool {
        *hash == self.archive.anchor() || self.archive.contains(hash)
    }

    /// Add a batch of records and bring every derived structure up to date
    pub fn add_records<I>(&mut self, records: I) -> ChainUpdate
    where
        I: IntoIterator<Item = ChainRecord>,
    {
        let root = self.index.root();
        let mut settled = 0;
        let mut fresh = Vec::new();
        for r in records {
            if self.archive.contains(&r.hash) {
                settled += 1;
            } else if r.parent_hash != root && self.is_settled(&r.parent_hash) {
                // Forks off below the root: it and anything built on it is dead
                settled += 1;
                self.index.discard(r.hash);
            } else {
                fresh.push(r);
            }
        }
        if settled > 0 {
            log::debug!("ignored {} records at or below the archive", settled);
        }

        let summary = self.index.insert(fresh);
        for (hash, reason) in &summary.rejected {
            log::warn!("rejected record {}: {}", hash.short(), reason);
        }
        let evicted = self.index.prune_orphans(self.config.max_orphan_records);

        let events = self.publish_tip_change();
        let petrified = self.petrify();
        self.tip = self.index.canonical_tip();

        ChainUpdate {
            summary,
            settled,
            events,
            petrified,
            evicted,
        }
    }

    /// Diff the previous tip against the current one, publish the change
    /// and mirror it into the view.
    fn publish_tip_change(&mut self) -> Vec<ChainEvent> {
        let new_tip = self.index.canonical_tip();
        if new_tip == self.tip {
            return Vec::new();
        }
        let diff = match self.index.diff(&self.tip, &new_tip) {
            Ok(diff) => diff,
            Err(e) => {
                log::error!("cannot diff {} against {}: {}", self.tip.short(), new_tip.short(), e);
                self.tip = new_tip;
                self.path = self.index.canonical_path();
                return Vec::new();
            }
        };
        if !diff.to_remove.is_empty() {
            log::info!(
                "reorganization at {}: {} blocks removed, {} added",
                diff.ancestor.short(),
                diff.to_remove.len(),
                diff.to_add.len()
            );
        } else {
            log::debug!("tip advanced by {} to {}", diff.to_add.len(), new_tip.short());
        }

        let events = self.diff_events(&diff);
        self.feed.publish(&events);
        self.mirror_view(&diff);
        self.path.truncate(diff.ancestor_distance as usize);
        self.path.extend(diff.to_add.iter().rev());
        self.tip = new_tip;
        events
    }

    /// Removes from the old tip downward, then adds from the ancestor upward
    fn diff_events(&self, diff: &ChainDiff) -> Vec<ChainEvent> {
        let fork_index = self.archive.count() + diff.ancestor_distance;
        let removes = diff.to_remove.len() as u64;
        let mut events = Vec::with_capacity(diff.to_remove.len() + diff.to_add.len());
        for (i, hash) in diff.to_remove.iter().enumerate() {
            events.push(ChainEvent::remove(*hash, fork_index + removes - 1 - i as u64));
        }
        for (i, hash) in diff.to_add.iter().rev().enumerate() {
            events.push(ChainEvent::add(*hash, fork_index + i as u64));
        }
        events
    }

    fn mirror_view(&mut self, diff: &ChainDiff) {
        let fork_index = self.archive.count() + diff.ancestor_distance;
        let root_work = self.archive.root_work();
        let tuples: Vec<ViewTuple> = diff
            .to_add
            .iter()
            .rev()
            .enumerate()
            .filter_map(|(i, hash)| {
                let ancestry = self.index.work_and_distance(hash)?;
                Some(ViewTuple {
                    index: fork_index + i as u64,
                    hash: *hash,
                    work: root_work.saturating_add(ancestry.work),
                })
            })
            .collect();
        self.view.apply_change(fork_index, tuples);
        if self.view.sample_count() > self.config.view_thin_threshold {
            self.view.thin(RetainPolicy::Halving);
        }
    }

    fn petrify(&mut self) -> usize {
        match maybe_petrify(&mut self.index, &mut self.archive, self.policy.as_ref()) {
            Ok(records) => {
                self.petrify_failures = 0;
                self.path.drain(..records.len().min(self.path.len()));
                records.len()
            }
            Err(e) => {
                self.petrify_failures += 1;
                if self.petrify_failures >= self.config.petrify_alarm_threshold {
                    log::error!(
                        "petrify failed {} times in a row: {}",
                        self.petrify_failures,
                        e
                    );
                } else {
                    log::warn!("petrify attempt failed, retrying on next batch: {}", e);
                }
                0
            }
        }
    }

    /// Consecutive petrify attempts that failed
    pub fn petrify_failures(&self) -> u32 {
        self.petrify_failures
    }

    /// Number of blocks on the canonical chain, archived ones included
    pub fn length(&self) -> u64 {
        self.archive.count() + self.path.len() as u64
    }

    /// Number of archived blocks
    pub fn locked_length(&self) -> u64 {
        self.archive.count()
    }

    pub fn hash_for_index(&self, index: u64) -> Option<Hash> {
        let locked = self.archive.count();
        if index < locked {
            return self.archive.by_index(index);
        }
        let offset = usize::try_from(index - locked).ok()?;
        self.path.get(offset).copied()
    }

    /// Absolute index of a canonical or archived block
    pub fn index_for_hash(&self, hash: &Hash) -> Option<u64> {
        if let Some(index) = self.archive.lookup(hash) {
            return Some(index);
        }
        let ancestry = self.index.work_and_distance(hash)?;
        if ancestry.base != self.index.root() || ancestry.distance == 0 {
            return None;
        }
        let index = self.archive.count() + ancestry.distance - 1;
        (self.hash_for_index(index) == Some(*hash)).then_some(index)
    }

    /// Index, hash and cumulative work of a canonical block. Work is only
    /// known from the root upward, so deeper archived blocks give `None`.
    pub fn tuple_for_index(&self, index: u64) -> Option<ViewTuple> {
        let hash = self.hash_for_index(index)?;
        let root_work = self.archive.root_work();
        if hash == self.archive.root() {
            return Some(ViewTuple {
                index,
                hash,
                work: root_work,
            });
        }
        let ancestry = self.index.work_and_distance(&hash)?;
        Some(ViewTuple {
            index,
            hash,
            work: root_work.saturating_add(ancestry.work),
        })
    }

    /// Cumulative work of the canonical tip, archived blocks included
    pub fn total_work(&self) -> Work {
        let unsettled = self
            .index
            .work_and_distance(&self.tip)
            .map(|a| a.work)
            .unwrap_or(0);
        self.archive.root_work().saturating_add(unsettled)
    }

    pub fn canonical_tip(&self) -> Hash {
        self.tip
    }

    /// Unsettled part of the canonical chain, oldest first
    pub fn canonical_path(&self) -> Vec<Hash> {
        self.path.clone()
    }

    pub fn root(&self) -> Hash {
        self.index.root()
    }

    pub fn anchor(&self) -> Hash {
        self.archive.anchor()
    }

    pub fn work_and_distance(&self, hash: &Hash) -> Option<Ancestry> {
        self.index.work_and_distance(hash)
    }

    /// Parents to fetch from peers to connect orphaned branches
    pub fn missing_parents(&self) -> BTreeSet<Hash> {
        self.index.missing_parents()
    }

    pub fn subscribe(&self) -> Subscription {
        self.feed.subscribe()
    }

    /// Locator over the full canonical chain, tip first, ending at index 0.
    /// Just the anchor while the chain is empty.
    pub fn locator_hashes(&self) -> Vec<Hash> {
        let length = self.length();
        if length == 0 {
            return vec![self.archive.anchor()];
        }
        locator_indices(length - 1, self.config.locator_dense_samples)
            .into_iter()
            .filter_map(|i| self.hash_for_index(i))
            .collect()
    }

    pub fn view(&self) -> &ChainView {
        &self.view
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}
