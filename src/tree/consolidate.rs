//! Chain-to-base-page rebuilding.
//!
//! One newest-to-oldest pass over a chain yields the page's live content:
//! sorted records for a leaf, sorted routing entries for an inner page. The
//! split engine reuses the same pass to find its median, and
//! [`BwTree::consolidate`] turns it into a fresh base page installed with one
//! CAS against the head it started from.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use super::handle::Scratch;
use super::{BwTree, MAX_CHAIN_LEN};
use crate::mapping::Pid;
use crate::node::{InnerPage, LeafPage, Node, NodeGuard, NodeKind, NodePtr, RetiredChain, Separator, free_chain};
use crate::stats::PageClass;
use crate::tracing_helpers::{debug_log, trace_log};

/// Links and upper bound of a collected page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PageBounds<K> {
    pub(super) prev: Option<Pid>,
    pub(super) next: Option<Pid>,
    pub(super) high: Separator<K>,
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Copy + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Replace the chain of `pid` by an equivalent base page.
    ///
    /// Returns `false` when the page has no deltas, when its content cannot
    /// be collected yet, or when another writer changed the head first.
    pub(super) fn consolidate(
        &self,
        pid: Pid,
        guard: &NodeGuard<'_, '_, K, V>,
        scratch: &mut Scratch<K, V>,
    ) -> bool {
        let head = self.head(pid);
        // SAFETY: loaded from the mapping table under `guard`.
        let node = unsafe { head.get(guard) };
        let header = node.header();
        if header.deltas() == 0 {
            return false;
        }

        let class = PageClass::of_level(header.level);
        let fresh = if header.is_leaf() {
            let bounds = Self::collect_leaf(pid, node, guard, scratch);
            Node::leaf(LeafPage {
                records: scratch.records.drain(..).collect(),
                prev: bounds.prev,
                next: bounds.next,
                high: bounds.high,
            })
        } else {
            let Some(bounds) = Self::collect_inner(pid, node, guard, scratch) else {
                debug_log!(%pid, "inner consolidation deferred: an index post is pending");
                return false;
            };
            Node::inner(
                InnerPage {
                    entries: scratch.entries.drain(..).collect(),
                    prev: bounds.prev,
                    next: bounds.next,
                },
                header.level,
            )
        };

        let fresh = NodePtr::leak(fresh);
        if !self.install(pid, head, fresh) {
            self.stats.record_consolidation(class, false);
            trace_log!(%pid, "consolidation lost its CAS");
            // SAFETY: never published; a base page has no origin.
            unsafe { free_chain(fresh) };
            return false;
        }

        // SAFETY: the CAS just unlinked `head`; only this thread holds it.
        guard.retire(unsafe { RetiredChain::new(head) });
        self.stats.record_consolidation(class, true);
        debug_log!(%pid, level = header.level, deltas = header.deltas(), "page consolidated");
        true
    }

    /// Live records of the leaf chain headed by `head`, sorted into
    /// `scratch.records`.
    pub(super) fn collect_leaf(
        pid: Pid,
        head: &Node<K, V>,
        guard: &NodeGuard<'_, '_, K, V>,
        scratch: &mut Scratch<K, V>,
    ) -> PageBounds<K> {
        let Scratch {
            records,
            superseded,
            ..
        } = scratch;
        records.clear();
        superseded.clear();

        // Newest split: records above its key live at its sidelink.
        let mut split: Option<(K, Pid)> = None;
        let mut node = head;

        for _ in 0..MAX_CHAIN_LEN {
            match node.kind() {
                NodeKind::Insert(delta) => {
                    let inside = split.is_none_or(|(bound, _)| delta.key <= bound);
                    if inside && !superseded.contains(&delta.key) {
                        records.push((delta.key, delta.value.clone()));
                        if delta.key_existed_before {
                            superseded.insert(delta.key);
                        }
                    }
                }

                NodeKind::Delete(delta) => {
                    superseded.insert(delta.key);
                }

                NodeKind::Split(delta) => {
                    if split.is_none() {
                        split = Some((delta.key, delta.sidelink));
                    }
                }

                NodeKind::Leaf(page) => {
                    records.extend(
                        page.records
                            .iter()
                            .filter(|(key, _)| split.is_none_or(|(bound, _)| *key <= bound))
                            .filter(|(key, _)| !superseded.contains(key))
                            .cloned(),
                    );
                    records.sort_unstable_by(|a, b| a.0.cmp(&b.0));

                    return match split {
                        Some((key, sidelink)) => PageBounds {
                            prev: page.prev,
                            next: Some(sidelink),
                            high: Separator::Finite(key),
                        },
                        None => PageBounds {
                            prev: page.prev,
                            next: page.next,
                            high: page.high,
                        },
                    };
                }

                NodeKind::Inner(_) | NodeKind::SplitInner(_) | NodeKind::Index(_) => {
                    panic!("{} node in the leaf chain of {pid}", node.kind().name());
                }
            }

            node = Self::below(node, guard);
        }

        panic!("chain of {pid} is longer than {MAX_CHAIN_LEN} nodes");
    }

    /// Routing entries of the inner chain headed by `head`, sorted into
    /// `scratch.entries`.
    ///
    /// Each child keeps the tightest bound proposed for it. A split child
    /// is narrowed to the split key only when the page already routes the
    /// whole range the split handed away. Returns `None` while a post this
    /// page depends on is still in flight: the delta narrows a child the page
    /// does not route to yet, or an older split of the same child has not
    /// been posted and narrowing now would leave its range unrouted.
    pub(super) fn collect_inner(
        pid: Pid,
        head: &Node<K, V>,
        guard: &NodeGuard<'_, '_, K, V>,
        scratch: &mut Scratch<K, V>,
    ) -> Option<PageBounds<K>> {
        let Scratch {
            entries,
            bounds,
            tightened,
            ..
        } = scratch;
        entries.clear();
        bounds.clear();
        tightened.clear();

        let mut split: Option<(K, Pid)> = None;
        let mut node = head;

        for _ in 0..MAX_CHAIN_LEN {
            match node.kind() {
                NodeKind::Index(delta) => {
                    propose(bounds, delta.child, delta.key_right);
                    tightened.push((delta.old_child, delta.key_left, delta.key_right));
                }

                NodeKind::SplitInner(delta) => {
                    if split.is_none() {
                        split = Some((delta.key, delta.sidelink));
                    }
                }

                NodeKind::Inner(page) => {
                    for &(bound, child) in page.entries.iter() {
                        propose(bounds, child, bound);
                    }

                    // Splits of one child happen at decreasing keys: replay
                    // them oldest first.
                    tightened.sort_unstable_by(|a, b| b.1.cmp(&a.1));
                    for &(child, key_left, key_right) in tightened.iter() {
                        let current = bounds.get_mut(&child)?;
                        let left = Separator::Finite(key_left);
                        if *current <= left {
                            // Posted twice, or the base page already has it.
                            continue;
                        }
                        if *current > key_right {
                            return None;
                        }
                        *current = left;
                    }

                    let limit = split.map(|(key, _)| Separator::Finite(key));
                    entries.extend(
                        bounds
                            .drain()
                            .map(|(child, bound)| (bound, child))
                            .filter(|(bound, _)| limit.is_none_or(|limit| *bound <= limit)),
                    );
                    entries.sort_unstable();

                    return Some(match split {
                        Some((key, sidelink)) => PageBounds {
                            prev: page.prev,
                            next: Some(sidelink),
                            high: Separator::Finite(key),
                        },
                        None => PageBounds {
                            prev: page.prev,
                            next: page.next,
                            high: page.high().copied().unwrap_or(Separator::Infinity),
                        },
                    });
                }

                NodeKind::Leaf(_) | NodeKind::Insert(_) | NodeKind::Delete(_) | NodeKind::Split(_) => {
                    panic!("{} node in the inner chain of {pid}", node.kind().name());
                }
            }

            node = Self::below(node, guard);
        }

        panic!("chain of {pid} is longer than {MAX_CHAIN_LEN} nodes");
    }
}

/// Keep the tighter of `bound` and whatever `child` already has.
fn propose<K: Ord>(
    bounds: &mut HashMap<Pid, Separator<K>>,
    child: Pid,
    bound: Separator<K>,
) {
    match bounds.entry(child) {
        Entry::Occupied(mut slot) => {
            if bound < *slot.get() {
                slot.insert(bound);
            }
        }
        Entry::Vacant(slot) => {
            slot.insert(bound);
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Fail fast in tests")]
mod tests {
    use super::*;
    use crate::node::{DeltaIndex, Header};
    use crate::settings::Settings;

    fn lazy_tree(split: usize) -> BwTree<u64, u64> {
        let settings = Settings::default()
            .with_split_leaf(split)
            .with_split_inner([split])
            .with_consolidate_leaf(1_000)
            .with_consolidate_inner([1_000]);
        BwTree::with_settings(settings).unwrap()
    }

    fn pid(index: usize) -> Pid {
        Pid::from_index(index)
    }

    // ==================== Leaves ====================

    #[test]
    fn test_leaf_consolidation_keeps_live_records() {
        let tree = lazy_tree(64);
        let mut handle = tree.handle();
        for key in [5, 1, 9, 3, 7] {
            tree.insert(key, key * 10, &mut handle);
        }
        tree.insert(3, 31, &mut handle);
        tree.delete_key(&9, &mut handle);

        let root = tree.root_pid();
        assert!(tree.consolidate_page(root, &mut handle));

        let pinned = handle.pin();
        // SAFETY: loaded under the guard.
        let node = unsafe { tree.head(root).get(&pinned.guard) };
        assert_eq!(node.header(), Header { len: 4, depth: 1, level: 0 });
        let NodeKind::Leaf(page) = node.kind() else {
            panic!("expected a leaf base page");
        };
        assert_eq!(&*page.records, &[(1, 10), (3, 31), (5, 50), (7, 70)]);
        assert_eq!(page.high, Separator::Infinity);
    }

    #[test]
    fn test_consolidation_is_idempotent() {
        let tree = lazy_tree(64);
        let mut handle = tree.handle();
        for key in 0..20 {
            tree.insert(key, key, &mut handle);
        }
        let root = tree.root_pid();

        assert!(tree.consolidate_page(root, &mut handle));
        let first = tree.leaf_keys(&mut handle);
        assert!(!tree.consolidate_page(root, &mut handle));
        assert_eq!(tree.leaf_keys(&mut handle), first);
        assert_eq!(tree.stats().leaf_consolidations, 1);
    }

    #[test]
    fn test_leaf_consolidation_honours_split_boundary() {
        let tree = lazy_tree(4);
        let mut handle = tree.handle();
        for key in 1..=5 {
            tree.insert(key, key, &mut handle);
        }
        let left = tree.leaf_pid_for(&1, &mut handle);
        let right = tree.leaf_pid_for(&5, &mut handle);
        assert_ne!(left, right);

        assert!(tree.consolidate_page(left, &mut handle));

        let pinned = handle.pin();
        // SAFETY: loaded under the guard.
        let node = unsafe { tree.head(left).get(&pinned.guard) };
        let NodeKind::Leaf(page) = node.kind() else {
            panic!("expected a leaf base page");
        };
        assert_eq!(&*page.records, &[(1, 1), (2, 2)]);
        assert_eq!(page.high, Separator::Finite(2));
        assert_eq!(page.next, Some(right));
    }

    #[test]
    fn test_failed_consolidation_leaves_page_alone() {
        let tree = lazy_tree(64);
        let mut handle = tree.handle();
        for key in 0..4 {
            tree.insert(key, key, &mut handle);
        }
        let root = tree.root_pid();

        let stale = tree.head(root);
        tree.insert(99, 99, &mut handle);
        let current = tree.head(root);
        assert_ne!(stale, current);

        // The stale head is still the origin of the new one, so it stays
        // readable while the page is not consolidated.
        let pinned = handle.pin();
        // Rebuilding from the stale head must not replace the newer chain.
        // SAFETY: loaded under the guard.
        let node = unsafe { stale.get(&pinned.guard) };
        let bounds = BwTree::collect_leaf(root, node, &pinned.guard, pinned.scratch);
        let fresh = NodePtr::leak(Node::leaf(LeafPage {
            records: pinned.scratch.records.drain(..).collect(),
            prev: bounds.prev,
            next: bounds.next,
            high: bounds.high,
        }));
        assert!(!tree.install(root, stale, fresh));
        // SAFETY: never published.
        unsafe { free_chain(fresh) };
        drop(pinned);

        assert_eq!(tree.search(&99, &mut handle), Some(99));
    }

    // ==================== Inner pages ====================

    #[test]
    fn test_inner_consolidation_keeps_routing() {
        let tree = lazy_tree(4);
        let mut handle = tree.handle();
        handle.reseed(5);
        for key in 0..24 {
            tree.insert(key, key, &mut handle);
        }
        let root = tree.root_pid();
        assert!(tree.height(&mut handle) >= 2);

        tree.consolidate_page(root, &mut handle);

        let pinned = handle.pin();
        // SAFETY: loaded under the guard.
        let node = unsafe { tree.head(root).get(&pinned.guard) };
        let NodeKind::Inner(page) = node.kind() else {
            panic!("expected an inner base page");
        };
        assert!(page.entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
        assert_eq!(page.high(), Some(&Separator::Infinity));
        drop(pinned);

        for key in 0..24 {
            assert_eq!(tree.search(&key, &mut handle), Some(key));
        }
    }

    #[test]
    fn test_collect_inner_takes_tightest_bound() {
        let tree = lazy_tree(64);
        let mut handle = tree.handle();
        let pinned = handle.pin();
        let mut scratch = Scratch::default();

        // Base routes everything to X; X split into X|Y at 10, then Y split
        // into Y|Z at 20.
        let (x, y, z) = (pid(1), pid(2), pid(3));
        let base = Node::<u64, u64>::inner(
            InnerPage {
                entries: vec![(Separator::Infinity, x)].into_boxed_slice(),
                prev: None,
                next: None,
            },
            1,
        );
        let header = base.header();
        let base = NodePtr::leak(base);

        let y_over_z = Node::delta(
            base,
            header,
            NodeKind::Index(DeltaIndex {
                key_left: 20,
                key_right: Separator::Infinity,
                child: z,
                old_child: y,
            }),
        );
        let header = y_over_z.header();
        let y_over_z = NodePtr::leak(y_over_z);

        // Y is not routed yet: its lower bound is unknown.
        // SAFETY: owned by the test.
        let node = unsafe { y_over_z.get(&pinned.guard) };
        assert!(BwTree::collect_inner(pid(0), node, &pinned.guard, &mut scratch).is_none());

        let x_over_y = NodePtr::leak(Node::delta(
            y_over_z,
            header,
            NodeKind::Index(DeltaIndex {
                key_left: 10,
                key_right: Separator::Infinity,
                child: y,
                old_child: x,
            }),
        ));
        // SAFETY: owned by the test.
        let node = unsafe { x_over_y.get(&pinned.guard) };
        let bounds = BwTree::collect_inner(pid(0), node, &pinned.guard, &mut scratch).unwrap();

        assert_eq!(bounds.high, Separator::Infinity);
        assert_eq!(
            scratch.entries,
            vec![
                (Separator::Finite(10), x),
                (Separator::Finite(20), y),
                (Separator::Infinity, z),
            ]
        );

        drop(pinned);
        // SAFETY: never published.
        unsafe { free_chain(x_over_y) };
    }

    /// Inner base page at level 1 with the given entries.
    fn inner_base(entries: Vec<(Separator<u64>, Pid)>) -> (NodePtr<u64, u64>, Header) {
        let base = Node::<u64, u64>::inner(
            InnerPage {
                entries: entries.into_boxed_slice(),
                prev: None,
                next: None,
            },
            1,
        );
        let header = base.header();
        (NodePtr::leak(base), header)
    }

    /// Prepend the index delta `(key_left, key_right] -> child` to `below`.
    fn post(
        below: (NodePtr<u64, u64>, Header),
        key_left: u64,
        key_right: Separator<u64>,
        child: Pid,
        old_child: Pid,
    ) -> (NodePtr<u64, u64>, Header) {
        let delta = Node::delta(
            below.0,
            below.1,
            NodeKind::Index(DeltaIndex {
                key_left,
                key_right,
                child,
                old_child,
            }),
        );
        let header = delta.header();
        (NodePtr::leak(delta), header)
    }

    #[test]
    fn test_collect_inner_waits_for_older_split_of_same_child() {
        let tree = lazy_tree(64);
        let mut handle = tree.handle();
        let pinned = handle.pin();
        let mut scratch = Scratch::default();

        // C split at 20 (right half D, not posted yet), then again at 10
        // (right half E, posted first).
        let (c, d, e) = (pid(1), pid(2), pid(3));
        let base = inner_base(vec![(Separator::Infinity, c)]);
        let newer_first = post(base, 10, Separator::Finite(20), e, c);

        // Narrowing C to 10 now would leave (20, +inf] with no child.
        // SAFETY: owned by the test.
        let node = unsafe { newer_first.0.get(&pinned.guard) };
        assert!(BwTree::collect_inner(pid(0), node, &pinned.guard, &mut scratch).is_none());

        let both = post(newer_first, 20, Separator::Infinity, d, c);
        // SAFETY: owned by the test.
        let node = unsafe { both.0.get(&pinned.guard) };
        let bounds = BwTree::collect_inner(pid(0), node, &pinned.guard, &mut scratch).unwrap();

        assert_eq!(bounds.high, Separator::Infinity);
        assert_eq!(bounds.next, None);
        assert_eq!(
            scratch.entries,
            vec![
                (Separator::Finite(10), c),
                (Separator::Finite(20), e),
                (Separator::Infinity, d),
            ]
        );

        drop(pinned);
        // SAFETY: never published.
        unsafe { free_chain(both.0) };
    }

    #[test]
    fn test_collect_inner_posts_in_split_order() {
        let tree = lazy_tree(64);
        let mut handle = tree.handle();
        let pinned = handle.pin();
        let mut scratch = Scratch::default();

        let (c, d, e) = (pid(1), pid(2), pid(3));
        let base = inner_base(vec![(Separator::Finite(50), pid(4)), (Separator::Infinity, c)]);
        let first = post(base, 80, Separator::Infinity, d, c);
        let second = post(first, 60, Separator::Finite(80), e, c);

        // SAFETY: owned by the test.
        let node = unsafe { second.0.get(&pinned.guard) };
        BwTree::collect_inner(pid(0), node, &pinned.guard, &mut scratch).unwrap();
        assert_eq!(
            scratch.entries,
            vec![
                (Separator::Finite(50), pid(4)),
                (Separator::Finite(60), c),
                (Separator::Finite(80), e),
                (Separator::Infinity, d),
            ]
        );

        drop(pinned);
        // SAFETY: never published.
        unsafe { free_chain(second.0) };
    }

    #[test]
    fn test_collect_inner_ignores_repeated_post() {
        let tree = lazy_tree(64);
        let mut handle = tree.handle();
        let pinned = handle.pin();
        let mut scratch = Scratch::default();

        // A new root built over the level already routes to D; the split's
        // own post arrives afterwards.
        let (c, d) = (pid(1), pid(2));
        let base = inner_base(vec![(Separator::Finite(10), c), (Separator::Infinity, d)]);
        let repeated = post(base, 10, Separator::Infinity, d, c);
        let repeated = post(repeated, 10, Separator::Infinity, d, c);

        // SAFETY: owned by the test.
        let node = unsafe { repeated.0.get(&pinned.guard) };
        BwTree::collect_inner(pid(0), node, &pinned.guard, &mut scratch).unwrap();
        assert_eq!(
            scratch.entries,
            vec![(Separator::Finite(10), c), (Separator::Infinity, d)]
        );

        drop(pinned);
        // SAFETY: never published.
        unsafe { free_chain(repeated.0) };
    }
}
