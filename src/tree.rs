//! `BwTree` - a lock-free ordered index built from delta chains.
//!
//! This module owns the tree value itself (mapping table, root PID, epoch
//! manager, counters) and the helpers shared by the operation modules:
//!
//! - [`traverse`]: key-to-page resolution and level seeking
//! - [`update`]: `search`, `insert`, `delete_key` and deferred maintenance
//! - [`consolidate`]: chain-to-base-page rebuilding
//! - [`split`]: page splits, parent index posting and root growth
//! - [`diagnostics`]: structural inspection used by tests and harnesses

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::sync::atomic::AtomicUsize;

use rand::Rng;
use rand::rngs::SmallRng;

use crate::epoch::EpochManager;
use crate::mapping::{MappingTable, MappingTableFull, Pid};
use crate::node::{Header, LeafPage, Node, NodeGuard, NodePtr, RetiredChain, Separator, free_chain};
use crate::ordering::{READ_ORD, RELAXED};
use crate::settings::{Settings, SettingsError};
use crate::stats::{StatsSnapshot, TreeStats};
use crate::tracing_helpers::error_log;

mod consolidate;
mod diagnostics;
mod handle;
mod split;
mod traverse;
mod update;

#[cfg(test)]
mod shuttle_tests;

pub use handle::TreeHandle;

use self::traverse::{Candidate, Maintenance};

/// Upper bound on pages visited by one traversal or seek.
const MAX_PAGE_HOPS: usize = 1 << 16;

/// Upper bound on nodes walked in one chain.
const MAX_CHAIN_LEN: usize = 1 << 16;

// ============================================================================
//  BwTree
// ============================================================================

/// A lock-free ordered map from fixed-size keys to values.
///
/// Pages are never modified in place. Writers prepend immutable delta
/// records to a page's chain with a single CAS on its mapping-table slot;
/// long chains are consolidated into fresh base pages and oversized pages are
/// split, both inline after the operation that noticed them. Unlinked chains
/// are released by an epoch-based reclaimer once no traversal can still see
/// them.
///
/// Every operation takes the calling thread's [`TreeHandle`]:
///
/// ```rust
/// use bwtree::BwTree;
///
/// let tree: BwTree<u64, u64> = BwTree::new();
/// let mut handle = tree.handle();
///
/// tree.insert(7, 70, &mut handle);
/// assert_eq!(tree.search(&7, &mut handle), Some(70));
///
/// assert!(tree.delete_key(&7, &mut handle));
/// assert_eq!(tree.search(&7, &mut handle), None);
/// ```
///
/// `BwTree<K, V>` is `Send + Sync` when `K` and `V` are; share it by
/// reference (e.g. `std::thread::scope`) or through an `Arc` and give each
/// thread its own handle.
pub struct BwTree<K: Send, V: Send> {
    settings: Settings,

    /// PID to chain head. Owns every installed chain.
    mapping: MappingTable<Node<K, V>>,

    /// Index of the root PID. Only ever swung to a new, higher root.
    root: AtomicUsize,

    /// Owns every unlinked chain until it can be released.
    epoch: EpochManager<RetiredChain<K, V>>,

    stats: TreeStats,

    _marker: PhantomData<(K, V)>,
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Copy + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Create an empty tree with default [`Settings`].
    #[must_use]
    pub fn new() -> Self {
        Self::build(Settings::default())
    }

    /// Create an empty tree with the given settings.
    ///
    /// # Errors
    ///
    /// The [`SettingsError`] reported by [`Settings::validate`].
    pub fn with_settings(settings: Settings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self::build(settings))
    }

    fn build(settings: Settings) -> Self {
        let mapping = MappingTable::with_capacity(settings.mapping_capacity);

        let root = NodePtr::leak(Node::leaf(LeafPage {
            records: Box::new([]),
            prev: None,
            next: None,
            high: Separator::Infinity,
        }));
        let root_pid = match mapping.allocate(root.as_raw()) {
            Ok(pid) => pid,
            Err(err) => mapping_exhausted(err),
        };

        Self {
            epoch: EpochManager::new(settings.epoch),
            settings,
            mapping,
            root: AtomicUsize::new(root_pid.index()),
            stats: TreeStats::default(),
            _marker: PhantomData,
        }
    }

    /// Register the calling thread. Keep the handle for as long as the
    /// thread uses the tree; dropping it hands its pending garbage back to
    /// the tree.
    #[must_use]
    pub fn handle(&self) -> TreeHandle<'_, K, V> {
        TreeHandle::new(self)
    }

    /// Settings the tree was built with.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Copy of the diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.epoch.retired_count(), self.epoch.reclaimed_count())
    }

    /// PID of the current root page.
    #[must_use]
    pub fn root_pid(&self) -> Pid {
        Pid::from_index(self.root.load(READ_ORD))
    }

    /// Number of PIDs handed out so far, abandoned ones included.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.mapping.len()
    }

    // ------------------------------------------------------------------------
    //  Shared helpers
    // ------------------------------------------------------------------------

    /// Current chain head of a reachable page.
    #[inline(always)]
    fn head(&self, pid: Pid) -> NodePtr<K, V> {
        match self.mapping.read(pid) {
            Some(head) => NodePtr::from_raw(head),
            None => panic!("{pid} is reachable but its mapping slot is empty"),
        }
    }

    #[inline(always)]
    fn install(&self, pid: Pid, expected: NodePtr<K, V>, new: NodePtr<K, V>) -> bool {
        self.mapping.try_replace(pid, expected.as_raw(), new.as_raw())
    }

    /// Give `page` a PID. Aborts the process when the table is full.
    fn allocate(&self, page: NodePtr<K, V>) -> Pid {
        match self.mapping.allocate(page.as_raw()) {
            Ok(pid) => pid,
            Err(err) => mapping_exhausted(err),
        }
    }

    /// Clear the slot of a page that never became reachable and free it.
    fn discard_unreachable(&self, pid: Pid, page: NodePtr<K, V>) {
        let cleared = self.mapping.abandon(pid, page.as_raw());
        debug_assert!(cleared, "unreachable page {pid} was replaced");

        // SAFETY: no link to `pid` was ever published, so nobody else can
        // have loaded `page`. Base pages have no origin to free.
        drop(unsafe { page.reclaim() });
    }

    /// The node below `node` in its chain.
    #[inline(always)]
    fn below<'g>(node: &'g Node<K, V>, guard: &'g NodeGuard<'_, '_, K, V>) -> &'g Node<K, V> {
        match node.origin() {
            // SAFETY: origins of a node read under `guard` are protected by it.
            Some(origin) => unsafe { origin.get(guard) },
            None => panic!("{} node ends a chain without a base page", node.kind().name()),
        }
    }

    /// Flag a page for maintenance, rolling the admission dice.
    fn assess(&self, pid: Pid, header: Header, rng: &mut SmallRng) -> Option<Candidate> {
        let level = header.level;

        let action = if header.len > self.settings.split_threshold(level)
            && admit(rng, self.settings.split_admission, level)
        {
            Maintenance::Split
        } else if header.deltas() as usize >= self.settings.consolidate_threshold(level)
            && admit(rng, self.settings.consolidate_admission, level)
        {
            Maintenance::Consolidate
        } else {
            return None;
        };

        Some(Candidate { pid, level, action })
    }
}

impl<K, V> Default for BwTree<K, V>
where
    K: Ord + Copy + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Send, V: Send> Drop for BwTree<K, V> {
    fn drop(&mut self) {
        // Handles borrow the tree, so none is alive and nothing is pinned.
        for head in self.mapping.drain() {
            // SAFETY: installed chains are owned by the table and disjoint
            // from everything the epoch manager still holds.
            unsafe { free_chain(NodePtr::from_raw(head)) };
        }
    }
}

impl<K: Send, V: Send> StdFmt::Debug for BwTree<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("BwTree")
            .field("root", &self.root.load(RELAXED))
            .field("mapping", &self.mapping)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Admission roll: act with probability `base / (level + 1)`.
fn admit(rng: &mut SmallRng, base: f64, level: u16) -> bool {
    let probability = base / (f64::from(level) + 1.0);
    probability >= 1.0 || rng.gen_bool(probability)
}

#[cold]
fn mapping_exhausted(err: MappingTableFull) -> ! {
    error_log!(capacity = err.capacity, "mapping table exhausted, aborting");
    eprintln!("bwtree: {err}");
    std::process::abort()
}

// ============================================================================
//  Tests
// ============================================================================
