//! Per-thread tree context.

use std::collections::{BTreeSet, HashMap};
use std::fmt as StdFmt;
use std::ptr as StdPtr;

use rand::SeedableRng;
use rand::rngs::SmallRng;

use super::BwTree;
use crate::epoch::EpochHandle;
use crate::mapping::Pid;
use crate::node::{NodeGuard, RetiredChain, Separator};

/// A thread's handle on a [`BwTree`].
///
/// Bundles everything an operation needs besides the tree itself: the
/// thread's epoch participation, its admission RNG and reusable scratch
/// buffers for consolidation. Create one per thread with
/// [`BwTree::handle`] and pass it to every call.
///
/// Dropping the handle tells the tree the thread is done. Its retired chains
/// that are not yet safe to release are handed to the tree and released by
/// other handles (or when the tree drops). Leaking a handle with
/// `mem::forget` leaks its garbage and pins nothing: its slot stays
/// inactive.
pub struct TreeHandle<'t, K: Send, V: Send> {
    tree: &'t BwTree<K, V>,
    epoch: EpochHandle<'t, RetiredChain<K, V>>,
    rng: SmallRng,
    scratch: Scratch<K, V>,
}

impl<'t, K: Send, V: Send> TreeHandle<'t, K, V> {
    pub(super) fn new(tree: &'t BwTree<K, V>) -> Self {
        Self {
            tree,
            epoch: tree.epoch.register(),
            rng: SmallRng::from_entropy(),
            scratch: Scratch::default(),
        }
    }

    /// Reseed the admission RNG, making maintenance decisions reproducible
    /// for single-threaded runs.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    /// Release every chain this handle retired that is already safe to
    /// release. Returns how many were released.
    pub fn flush(&mut self) -> usize {
        self.epoch.flush()
    }

    /// Chains retired through this handle and not released yet.
    #[must_use]
    pub fn pending_garbage(&self) -> usize {
        self.epoch.pending()
    }

    pub(super) fn belongs_to(&self, tree: &BwTree<K, V>) -> bool {
        StdPtr::eq(self.tree, tree)
    }

    /// Enter an operation.
    pub(super) fn pin(&mut self) -> Pinned<'_, 't, K, V> {
        Pinned {
            guard: self.epoch.pin(),
            rng: &mut self.rng,
            scratch: &mut self.scratch,
        }
    }
}

impl<K: Send, V: Send> StdFmt::Debug for TreeHandle<'_, K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("TreeHandle")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// A pinned handle, split into its parts so they can be borrowed separately.
pub(super) struct Pinned<'h, 't, K: Send, V: Send> {
    pub(super) guard: NodeGuard<'h, 't, K, V>,
    pub(super) rng: &'h mut SmallRng,
    pub(super) scratch: &'h mut Scratch<K, V>,
}

/// Buffers reused across operations of one thread.
pub(super) struct Scratch<K, V> {
    /// Leaf records being rebuilt.
    pub(super) records: Vec<(K, V)>,

    /// Keys already decided by a newer delta.
    pub(super) superseded: BTreeSet<K>,

    /// Inner entries being rebuilt.
    pub(super) entries: Vec<(Separator<K>, Pid)>,

    /// Tightest upper bound proposed per child.
    pub(super) bounds: HashMap<Pid, Separator<K>>,

    /// `(old_child, key_left, key_right)` of every index delta, applied
    /// once every child of the page is known.
    pub(super) tightened: Vec<(Pid, K, Separator<K>)>,

    /// Last page visited per level by the latest traversal.
    pub(super) path: Vec<Option<Pid>>,
}

impl<K, V> Default for Scratch<K, V> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            superseded: BTreeSet::new(),
            entries: Vec::new(),
            bounds: HashMap::new(),
            tightened: Vec::new(),
            path: Vec::new(),
        }
    }
}

impl<K, V> Scratch<K, V> {
    /// Parent recorded for a page at `level`.
    pub(super) fn parent_of(&self, level: u16) -> Option<Pid> {
        self.path.get(usize::from(level) + 1).copied().flatten()
    }

    pub(super) fn remember(&mut self, level: u16, pid: Pid) {
        let index = usize::from(level);
        if self.path.len() <= index {
            self.path.resize(index + 1, None);
        }
        self.path[index] = Some(pid);
    }
}
