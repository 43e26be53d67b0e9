//! Chain view: a sparse summary of one chain
//!
//! Holds `(index, hash, cumulative work)` samples. Enough to build block
//! locators for `getheaders` requests and to check whether a batch of
//! headers from a peer extends something we know. Works standalone for
//! header-only clients, or mirrored from the chain index.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use crate::consensus::{ChainRecord, Work};
use crate::constants::DEFAULT_LOCATOR_DENSE_SAMPLES;
use crate::crypto::Hash;

/// Chain view errors
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("view encoding error: {0}")]
    Codec(#[from] bincode::Error),
}

/// One sampled chain position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewTuple {
    pub index: u64,
    pub hash: Hash,
    /// Cumulative work up to and including this block
    pub work: Work,
}

/// Index range touched by a successful `extend`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewUpdate {
    /// Chain length before the update
    pub old_end: u64,
    /// First index whose block was added or replaced
    pub new_start: u64,
    /// Chain length after the update
    pub new_end: u64,
}

impl ViewUpdate {
    /// Indices that were on the old chain but are no longer
    pub fn replaced(&self) -> std::ops::Range<u64> {
        self.new_start..self.old_end.max(self.new_start)
    }
}

/// Why a header batch was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendRejection {
    Empty,
    /// First header's parent is neither the anchor nor a sampled block
    UnknownParent(Hash),
    /// Header at this position does not link to the one before it
    NotLinked { position: usize },
    /// Resulting chain would have less work than the current one
    InsufficientWork { offered: Work, current: Work },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended(ViewUpdate),
    Rejected(ExtendRejection),
}

/// Which samples `thin` keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainPolicy {
    /// Exactly the samples the current locator uses
    Locator,
    /// Two samples per power-of-two distance from the tip
    Halving,
}

#[derive(Serialize, Deserialize)]
struct ViewSnapshot {
    anchor: Hash,
    dense_samples: u32,
    tuples: Vec<ViewTuple>,
}

/// Indices a block locator samples, newest first: `dense_samples` single
/// steps back from `last`, then the step doubles every `dense_samples`
/// entries. Always ends at 0.
pub fn locator_indices(last: u64, dense_samples: u32) -> Vec<u64> {
    let dense = dense_samples.max(1);
    let mut indices = Vec::new();
    let mut index = last;
    let mut step = 1u64;
    let mut remaining = dense;
    while index > 0 {
        indices.push(index);
        index = index.saturating_sub(step);
        remaining -= 1;
        if remaining == 0 {
            remaining = dense;
            step = step.saturating_mul(2);
        }
    }
    indices.push(0);
    indices
}

/// Sparse `(index, hash, work)` summary of a chain
#[derive(Debug, Clone)]
pub struct ChainView {
    anchor: Hash,
    samples: BTreeMap<u64, (Hash, Work)>,
    by_hash: HashMap<Hash, u64>,
    dense_samples: u32,
}

impl ChainView {
    /// Empty view of a chain whose first block has parent `anchor`
    pub fn new(anchor: Hash) -> Self {
        Self {
            anchor,
            samples: BTreeMap::new(),
            by_hash: HashMap::new(),
            dense_samples: DEFAULT_LOCATOR_DENSE_SAMPLES,
        }
    }

    /// Number of locator entries taken before the step doubles
    pub fn with_dense_samples(mut self, dense_samples: u32) -> Self {
        self.dense_samples = dense_samples.max(1);
        self
    }

    pub fn from_tuples<I>(anchor: Hash, tuples: I) -> Self
    where
        I: IntoIterator<Item = ViewTuple>,
    {
        let mut view = Self::new(anchor);
        for t in tuples {
            view.insert(t);
        }
        view
    }

    fn insert(&mut self, t: ViewTuple) {
        if let Some((old, _)) = self.samples.insert(t.index, (t.hash, t.work)) {
            self.by_hash.remove(&old);
        }
        self.by_hash.insert(t.hash, t.index);
    }

    pub fn anchor(&self) -> Hash {
        self.anchor
    }

    /// Index of the newest sample
    pub fn last_block_index(&self) -> Option<u64> {
        self.samples.keys().next_back().copied()
    }

    /// Chain length implied by the newest sample
    pub fn len(&self) -> u64 {
        self.last_block_index().map(|i| i + 1).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn tip(&self) -> Option<ViewTuple> {
        self.samples
            .iter()
            .next_back()
            .map(|(index, (hash, work))| ViewTuple {
                index: *index,
                hash: *hash,
                work: *work,
            })
    }

    pub fn tip_work(&self) -> Work {
        self.tip().map(|t| t.work).unwrap_or(0)
    }

    /// Sample with the largest index not above `index`: the point to
    /// rewind to when `index` itself was not kept.
    pub fn tuple_for_index(&self, index: u64) -> Option<ViewTuple> {
        self.samples
            .range(..=index)
            .next_back()
            .map(|(index, (hash, work))| ViewTuple {
                index: *index,
                hash: *hash,
                work: *work,
            })
    }

    pub fn tuple_for_hash(&self, hash: &Hash) -> Option<ViewTuple> {
        let index = *self.by_hash.get(hash)?;
        let (hash, work) = self.samples.get(&index)?;
        Some(ViewTuple {
            index,
            hash: *hash,
            work: *work,
        })
    }

    pub fn tuples(&self) -> Vec<ViewTuple> {
        self.samples
            .iter()
            .map(|(index, (hash, work))| ViewTuple {
                index: *index,
                hash: *hash,
                work: *work,
            })
            .collect()
    }

    /// Try to extend the view with a linked batch of headers.
    ///
    /// The first header must build on the anchor or on a sampled block, and
    /// the result must carry at least as much work as the current tip.
    /// Samples above the fork point are replaced.
    pub fn extend(&mut self, headers: &[ChainRecord]) -> ExtendOutcome {
        let first = match headers.first() {
            Some(first) => first,
            None => return ExtendOutcome::Rejected(ExtendRejection::Empty),
        };
        let (start, base_work) = if first.parent_hash == self.anchor {
            (0, 0)
        } else {
            match self.tuple_for_hash(&first.parent_hash) {
                Some(t) => (t.index + 1, t.work),
                None => {
                    return ExtendOutcome::Rejected(ExtendRejection::UnknownParent(
                        first.parent_hash,
                    ))
                }
            }
        };

        for (position, pair) in headers.windows(2).enumerate() {
            if pair[1].parent_hash != pair[0].hash {
                return ExtendOutcome::Rejected(ExtendRejection::NotLinked {
                    position: position + 1,
                });
            }
        }

        let offered = headers
            .iter()
            .fold(base_work, |acc, h| acc.saturating_add(h.work));
        let current = self.tip_work();
        if offered < current {
            return ExtendOutcome::Rejected(ExtendRejection::InsufficientWork { offered, current });
        }

        let old_end = self.len();
        let mut work = base_work;
        let tuples: Vec<ViewTuple> = headers
            .iter()
            .enumerate()
            .map(|(offset, h)| {
                work = work.saturating_add(h.work);
                ViewTuple {
                    index: start + offset as u64,
                    hash: h.hash,
                    work,
                }
            })
            .collect();
        self.apply_change(start, tuples);

        ExtendOutcome::Extended(ViewUpdate {
            old_end,
            new_start: start,
            new_end: self.len(),
        })
    }

    /// Drop every sample at or above `fork_index`, then add `tuples`
    pub fn apply_change<I>(&mut self, fork_index: u64, tuples: I)
    where
        I: IntoIterator<Item = ViewTuple>,
    {
        let dropped = self.samples.split_off(&fork_index);
        for (hash, _) in dropped.values() {
            self.by_hash.remove(hash);
        }
        for t in tuples {
            self.insert(t);
        }
    }

    fn locator_targets(&self) -> Vec<u64> {
        match self.last_block_index() {
            Some(last) => locator_indices(last, self.dense_samples),
            None => Vec::new(),
        }
    }

    /// Block locator hashes, newest first, for a `getheaders` request
    pub fn locator_hashes(&self) -> Vec<Hash> {
        let mut locator: Vec<Hash> = Vec::new();
        for index in self.locator_targets() {
            if let Some(t) = self.tuple_for_index(index) {
                if locator.last() != Some(&t.hash) {
                    locator.push(t.hash);
                }
            }
        }
        if locator.is_empty() {
            locator.push(self.anchor);
        }
        locator
    }

    fn halving_indices(last: u64) -> BTreeSet<u64> {
        let mut keep = BTreeSet::new();
        let mut index = last;
        let mut step = 1u64;
        let mut count = 2u32;
        loop {
            keep.insert(index);
            if index < step {
                break;
            }
            index -= step;
            count = count.saturating_sub(1);
            if count == 0 && index % (step * 2) == 0 {
                step *= 2;
                count = 2;
            }
        }
        keep.insert(0);
        keep
    }

    /// Discard samples the chosen scheme does not need. The tip and the
    /// oldest sample always survive.
    pub fn thin(&mut self, policy: RetainPolicy) {
        let last = match self.last_block_index() {
            Some(last) => last,
            None => return,
        };
        let wanted: Vec<u64> = match policy {
            RetainPolicy::Locator => self.locator_targets(),
            RetainPolicy::Halving => Self::halving_indices(last).into_iter().collect(),
        };
        let mut keep: BTreeSet<u64> = wanted
            .into_iter()
            .filter_map(|i| self.tuple_for_index(i).map(|t| t.index))
            .collect();
        keep.insert(last);
        if let Some(first) = self.samples.keys().next() {
            keep.insert(*first);
        }

        let before = self.samples.len();
        let by_hash = &mut self.by_hash;
        self.samples.retain(|index, (hash, _)| {
            let kept = keep.contains(index);
            if !kept {
                by_hash.remove(&*hash);
            }
            kept
        });
        log::trace!("thinned view from {} to {} samples", before, self.samples.len());
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ViewError> {
        let snapshot = ViewSnapshot {
            anchor: self.anchor,
            dense_samples: self.dense_samples,
            tuples: self.tuples(),
        };
        Ok(bincode::serialize(&snapshot)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ViewError> {
        let snapshot: ViewSnapshot = bincode::deserialize(bytes)?;
        Ok(Self::from_tuples(snapshot.anchor, snapshot.tuples).with_dense_samples(snapshot.dense_samples))
    }
}
