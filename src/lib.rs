//! ROHO (RH) Chain Index
//!
//! Fork-aware block tracking for a proof-of-work chain. Records arrive in
//! any order; the index keeps every branch, picks the heaviest one, reports
//! canonical changes to subscribers and moves deeply buried blocks into an
//! append-only archive.
//!
//! RH is the short form used in logs and protocol identifiers.

pub mod consensus;
pub mod crypto;
pub mod storage;
pub mod p2p;
pub mod node;

/// Default tunables. Every value can be overridden through `ChainConfig`.
pub mod constants {
    /// Canonical blocks kept unsettled above the archive
    pub const DEFAULT_PETRIFY_MARGIN: u64 = 100;

    /// Smallest number of blocks petrified at once
    pub const DEFAULT_PETRIFY_MIN_BATCH: u64 = 1;

    /// Orphan records held before the oldest groups are evicted
    pub const DEFAULT_MAX_ORPHAN_RECORDS: usize = 10_000;

    /// Locator entries taken at each step size before the step doubles
    pub const DEFAULT_LOCATOR_DENSE_SAMPLES: u32 = 10;

    /// View samples held before thinning
    pub const DEFAULT_VIEW_THIN_THRESHOLD: usize = 1024;

    /// Consecutive failed petrify attempts before an error-level alarm
    pub const DEFAULT_PETRIFY_ALARM_THRESHOLD: u32 = 3;

    /// Discarded hashes remembered so their descendants are refused
    pub const DEFAULT_MAX_DISCARDED_HASHES: usize = 10_000;
}
