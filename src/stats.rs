//! Diagnostic counters.
//!
//! Counters are relaxed atomics bumped on the operation paths; a
//! [`StatsSnapshot`] copies them out for reporting.

use std::sync::atomic::AtomicU64;

use crate::ordering::RELAXED;

/// Which kind of page a structure modification touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageClass {
    Leaf,
    Inner,
}

impl PageClass {
    pub(crate) const fn of_level(level: u16) -> Self {
        if level == 0 { Self::Leaf } else { Self::Inner }
    }
}

#[derive(Debug, Default)]
struct Outcome {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Outcome {
    fn record(&self, ok: bool) {
        let counter = if ok { &self.succeeded } else { &self.failed };
        counter.fetch_add(1, RELAXED);
    }

    fn load(&self) -> (u64, u64) {
        (self.succeeded.load(RELAXED), self.failed.load(RELAXED))
    }
}

/// Live counters of one tree.
#[derive(Debug, Default)]
pub(crate) struct TreeStats {
    cas_collisions: AtomicU64,
    leaf_splits: Outcome,
    inner_splits: Outcome,
    leaf_consolidations: Outcome,
    inner_consolidations: Outcome,
    root_growths: AtomicU64,
    index_posts: AtomicU64,
}

impl TreeStats {
    pub(crate) fn record_collision(&self) {
        self.cas_collisions.fetch_add(1, RELAXED);
    }

    pub(crate) fn record_split(&self, class: PageClass, ok: bool) {
        match class {
            PageClass::Leaf => self.leaf_splits.record(ok),
            PageClass::Inner => self.inner_splits.record(ok),
        }
    }

    pub(crate) fn record_consolidation(&self, class: PageClass, ok: bool) {
        match class {
            PageClass::Leaf => self.leaf_consolidations.record(ok),
            PageClass::Inner => self.inner_consolidations.record(ok),
        }
    }

    pub(crate) fn record_root_growth(&self) {
        self.root_growths.fetch_add(1, RELAXED);
    }

    pub(crate) fn record_index_post(&self) {
        self.index_posts.fetch_add(1, RELAXED);
    }

    pub(crate) fn snapshot(&self, retired: u64, reclaimed: u64) -> StatsSnapshot {
        let (leaf_splits, leaf_splits_failed) = self.leaf_splits.load();
        let (inner_splits, inner_splits_failed) = self.inner_splits.load();
        let (leaf_consolidations, leaf_consolidations_failed) = self.leaf_consolidations.load();
        let (inner_consolidations, inner_consolidations_failed) = self.inner_consolidations.load();

        StatsSnapshot {
            cas_collisions: self.cas_collisions.load(RELAXED),
            leaf_splits,
            leaf_splits_failed,
            inner_splits,
            inner_splits_failed,
            leaf_consolidations,
            leaf_consolidations_failed,
            inner_consolidations,
            inner_consolidations_failed,
            root_growths: self.root_growths.load(RELAXED),
            index_posts: self.index_posts.load(RELAXED),
            chains_retired: retired,
            chains_reclaimed: reclaimed,
        }
    }
}

/// Point-in-time copy of a tree's counters.
///
/// Counters are read one by one, so a snapshot taken under load is not an
/// atomic cut.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Delta prepends, consolidations and index posts that lost their CAS
    /// and were retried.
    pub cas_collisions: u64,

    /// Leaf splits installed.
    pub leaf_splits: u64,

    /// Leaf splits abandoned after a lost CAS.
    pub leaf_splits_failed: u64,

    /// Inner splits installed.
    pub inner_splits: u64,

    /// Inner splits abandoned after a lost CAS.
    pub inner_splits_failed: u64,

    /// Leaf consolidations installed.
    pub leaf_consolidations: u64,

    /// Leaf consolidations abandoned after a lost CAS.
    pub leaf_consolidations_failed: u64,

    /// Inner consolidations installed.
    pub inner_consolidations: u64,

    /// Inner consolidations abandoned after a lost CAS.
    pub inner_consolidations_failed: u64,

    /// New roots installed.
    pub root_growths: u64,

    /// Index deltas posted on parents.
    pub index_posts: u64,

    /// Unlinked chains handed to the reclaimer.
    pub chains_retired: u64,

    /// Unlinked chains released by the reclaimer.
    pub chains_reclaimed: u64,
}

impl StatsSnapshot {
    /// Splits installed at any level.
    #[must_use]
    pub const fn splits(&self) -> u64 {
        self.leaf_splits + self.inner_splits
    }

    /// Consolidations installed at any level.
    #[must_use]
    pub const fn consolidations(&self) -> u64 {
        self.leaf_consolidations + self.inner_consolidations
    }
}
