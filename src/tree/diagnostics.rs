//! Structural inspection for tests and harnesses.
//!
//! Nothing here is needed to use the tree. These walks pin like any other
//! operation and are safe to run concurrently with writers, but a concurrent
//! run only sees some interleaving of the pages it visits.

use super::handle::TreeHandle;
use super::{BwTree, MAX_CHAIN_LEN};
use crate::mapping::Pid;
use crate::node::{NodeGuard, NodeKind, Separator};

impl<K, V> BwTree<K, V>
where
    K: Ord + Copy + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Every live key, in the order the leaf level links them.
    ///
    /// # Panics
    ///
    /// If `handle` was created by another tree.
    pub fn leaf_keys(&self, handle: &mut TreeHandle<'_, K, V>) -> Vec<K> {
        self.check_handle(handle);
        let pinned = handle.pin();
        let mut keys = Vec::new();

        let mut pid = Some(self.leftmost_leaf(&pinned.guard));
        while let Some(current) = pid {
            // SAFETY: loaded from the mapping table under the guard.
            let node = unsafe { self.head(current).get(&pinned.guard) };
            let bounds = Self::collect_leaf(current, node, &pinned.guard, pinned.scratch);
            keys.extend(pinned.scratch.records.drain(..).map(|(key, _)| key));
            pid = bounds.next;
        }

        keys
    }

    /// PIDs of the leaf level, left to right.
    ///
    /// # Panics
    ///
    /// If `handle` was created by another tree.
    pub fn leaf_pids(&self, handle: &mut TreeHandle<'_, K, V>) -> Vec<Pid> {
        self.check_handle(handle);
        let pinned = handle.pin();
        let mut pids = Vec::new();

        let mut pid = Some(self.leftmost_leaf(&pinned.guard));
        while let Some(current) = pid {
            pids.push(current);
            // SAFETY: loaded from the mapping table under the guard.
            let node = unsafe { self.head(current).get(&pinned.guard) };
            pid = Self::extent(current, node, &pinned.guard).1;
        }

        pids
    }

    /// Number of levels, leaves included.
    ///
    /// # Panics
    ///
    /// If `handle` was created by another tree.
    pub fn height(&self, handle: &mut TreeHandle<'_, K, V>) -> usize {
        self.check_handle(handle);
        let pinned = handle.pin();

        // SAFETY: loaded from the mapping table under the guard.
        let root = unsafe { self.head(self.root_pid()).get(&pinned.guard) };
        usize::from(root.header().level) + 1
    }

    /// PID of the leaf whose range holds `key`.
    ///
    /// # Panics
    ///
    /// If `handle` was created by another tree.
    pub fn leaf_pid_for(&self, key: &K, handle: &mut TreeHandle<'_, K, V>) -> Pid {
        self.check_handle(handle);
        let pinned = handle.pin();

        self.seek(self.root_pid(), 0, &Separator::Finite(*key), &pinned.guard)
            .0
    }

    /// Consolidate one page now, regardless of thresholds. Returns whether a
    /// new base page was installed.
    ///
    /// # Panics
    ///
    /// If `handle` was created by another tree, or `pid` was never handed
    /// out.
    pub fn consolidate_page(&self, pid: Pid, handle: &mut TreeHandle<'_, K, V>) -> bool {
        self.check_handle(handle);
        let pinned = handle.pin();

        self.consolidate(pid, &pinned.guard, pinned.scratch)
    }

    /// Follow first children down from the root. Index deltas only ever
    /// route to pages right of an existing child, so the base page's first
    /// entry is always the leftmost child.
    fn leftmost_leaf(&self, guard: &NodeGuard<'_, '_, K, V>) -> Pid {
        let mut pid = self.root_pid();

        'pages: loop {
            // SAFETY: loaded from the mapping table under `guard`.
            let mut node = unsafe { self.head(pid).get(guard) };
            if node.header().is_leaf() {
                return pid;
            }

            for _ in 0..MAX_CHAIN_LEN {
                if let NodeKind::Inner(page) = node.kind() {
                    match page.entries.first() {
                        Some(&(_, child)) => {
                            pid = child;
                            continue 'pages;
                        }
                        None => panic!("inner page {pid} has no entries"),
                    }
                }
                node = Self::below(node, guard);
            }

            panic!("chain of {pid} is longer than {MAX_CHAIN_LEN} nodes");
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
