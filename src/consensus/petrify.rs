//! Petrification: moving settled blocks from the index into the archive
//!
//! A block buried deep enough under the canonical tip is treated as
//! permanent. Its record leaves the mutable index and only its hash is
//! kept, in the append-only archive.

use thiserror::Error;
use crate::crypto::Hash;
use crate::storage::{ArchiveError, ArchiveStore};
use super::{ChainIndex, ChainRecord, IndexError};

/// Petrify errors
#[derive(Debug, Error)]
pub enum PetrifyError {
    #[error("canonical path does not extend the archive: {0}")]
    Archive(#[from] ArchiveError),
    #[error("index refused rebase: {0}")]
    Index(#[from] IndexError),
    #[error("canonical path block {0} has no record")]
    MissingRecord(Hash),
}

/// Decides how many canonical blocks above the root to petrify.
///
/// `unsettled_depth` is the length of the canonical path in the index,
/// `total_depth` that plus the number of archived blocks.
pub trait PetrifyPolicy {
    fn count_to_petrify(&self, unsettled_depth: u64, total_depth: u64) -> u64;
}

impl<F> PetrifyPolicy for F
where
    F: Fn(u64, u64) -> u64,
{
    fn count_to_petrify(&self, unsettled_depth: u64, total_depth: u64) -> u64 {
        self(unsettled_depth, total_depth)
    }
}

/// Petrify everything except the newest `margin` canonical blocks, once at
/// least `min_batch` blocks qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyMargin {
    pub margin: u64,
    pub min_batch: u64,
}

impl SafetyMargin {
    pub fn new(margin: u64) -> Self {
        Self { margin, min_batch: 1 }
    }

    pub fn with_min_batch(mut self, min_batch: u64) -> Self {
        self.min_batch = min_batch.max(1);
        self
    }
}

impl PetrifyPolicy for SafetyMargin {
    fn count_to_petrify(&self, unsettled_depth: u64, _total_depth: u64) -> u64 {
        let count = unsettled_depth.saturating_sub(self.margin);
        if count >= self.min_batch {
            count
        } else {
            0
        }
    }
}

/// Petrify the oldest canonical blocks the policy asks for.
///
/// The archive append and the index rebase form one step: the records are
/// checked against the archive before anything is written, and the new root
/// is known to be on the canonical path. Returns the petrified records.
pub fn maybe_petrify<P>(
    index: &mut ChainIndex,
    archive: &mut ArchiveStore,
    policy: &P,
) -> Result<Vec<ChainRecord>, PetrifyError>
where
    P: PetrifyPolicy + ?Sized,
{
    let path = index.canonical_path();
    let unsettled = path.len() as u64;
    let count = policy
        .count_to_petrify(unsettled, unsettled + archive.count())
        .min(unsettled) as usize;
    if count == 0 {
        return Ok(Vec::new());
    }

    let records = path[..count]
        .iter()
        .map(|h| index.record(h).copied().ok_or(PetrifyError::MissingRecord(*h)))
        .collect::<Result<Vec<_>, _>>()?;
    archive.check_contiguous(&records)?;

    let new_root = records[count - 1].hash;
    archive.append(&records)?;
    if let Err(e) = index.rebase(&new_root) {
        // Unreachable while the path came from the same index; the archive
        // already moved, so this is a broken invariant.
        log::error!("rebase to {} refused after archiving: {}", new_root.short(), e);
        debug_assert!(false, "rebase after archive append failed: {}", e);
        return Err(e.into());
    }

    log::info!(
        "petrified {} blocks, archive now ends at {} ({})",
        count,
        archive.count() - 1,
        new_root.short()
    );
    Ok(records)
}
