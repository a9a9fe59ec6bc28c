//! Key-to-page resolution.
//!
//! Two walks live here. [`BwTree::find_data_page`] resolves a key all the way
//! down to the leaf chain that owns it and looks the key up on the way,
//! remembering the last page seen per level and flagging one inner page for
//! maintenance. [`BwTree::seek`] stops at a given level; split propagation
//! uses it to find the parent that must learn about a new sibling.
//!
//! Both follow the B-link rule: a page whose range ends below the target
//! (a split delta with a smaller key, a base page whose high bound is too
//! small) sends the walk right along its sibling link, so a reader never
//! needs the parent to be up to date.

use rand::rngs::SmallRng;

use super::handle::Scratch;
use super::{BwTree, MAX_CHAIN_LEN, MAX_PAGE_HOPS};
use crate::mapping::Pid;
use crate::node::{Header, Node, NodeGuard, NodeKind, NodePtr, Separator};

/// Structure modification a page asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Maintenance {
    Split,
    Consolidate,
}

/// A page flagged for maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Candidate {
    pub(super) pid: Pid,
    pub(super) level: u16,
    pub(super) action: Maintenance,
}

/// Outcome of resolving a key to its leaf chain.
pub(super) struct DataPage<'g, K, V> {
    pub(super) pid: Pid,

    /// Head observed when the lookup ran; writers CAS against it.
    pub(super) head: NodePtr<K, V>,
    pub(super) header: Header,

    /// Live value of the key, if any.
    pub(super) record: Option<&'g V>,

    /// First inner page on the way down that wants maintenance.
    pub(super) inner_candidate: Option<Candidate>,
}

/// Where a page sends a walk.
enum Step {
    Here,
    Right(Pid),
    Down(Pid),
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Copy + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Resolve `key` to the leaf chain that owns it.
    pub(super) fn find_data_page<'g>(
        &self,
        key: &K,
        guard: &'g NodeGuard<'_, '_, K, V>,
        rng: &mut SmallRng,
        scratch: &mut Scratch<K, V>,
    ) -> DataPage<'g, K, V> {
        let target = Separator::Finite(*key);
        let mut inner_candidate = None;
        let mut pid = self.root_pid();
        scratch.path.clear();

        'pages: for _ in 0..MAX_PAGE_HOPS {
            let head = self.head(pid);
            // SAFETY: loaded from the mapping table under `guard`.
            let head_node = unsafe { head.get(guard) };
            let header = head_node.header();
            scratch.remember(header.level, pid);

            if !header.is_leaf() && inner_candidate.is_none() {
                inner_candidate = self.assess(pid, header, rng);
            }

            let mut node = head_node;
            for _ in 0..MAX_CHAIN_LEN {
                match node.kind() {
                    NodeKind::Index(delta) if delta.routes(&target) => {
                        pid = delta.child;
                        continue 'pages;
                    }

                    NodeKind::Inner(page) => {
                        pid = match page.child_for(&target) {
                            Some(child) => child,
                            None => Self::sibling(pid, page.next),
                        };
                        continue 'pages;
                    }

                    NodeKind::Split(delta) | NodeKind::SplitInner(delta) if *key > delta.key => {
                        pid = delta.sidelink;
                        continue 'pages;
                    }

                    NodeKind::Insert(delta) if delta.key == *key => {
                        return DataPage {
                            pid,
                            head,
                            header,
                            record: Some(&delta.value),
                            inner_candidate,
                        };
                    }

                    NodeKind::Delete(delta) if delta.key == *key => {
                        return DataPage {
                            pid,
                            head,
                            header,
                            record: None,
                            inner_candidate,
                        };
                    }

                    NodeKind::Leaf(page) => {
                        if !page.high.covers(key) {
                            pid = Self::sibling(pid, page.next);
                            continue 'pages;
                        }

                        return DataPage {
                            pid,
                            head,
                            header,
                            record: page.get(key),
                            inner_candidate,
                        };
                    }

                    NodeKind::Index(_)
                    | NodeKind::Split(_)
                    | NodeKind::SplitInner(_)
                    | NodeKind::Insert(_)
                    | NodeKind::Delete(_) => {}
                }

                node = Self::below(node, guard);
            }

            panic!("chain of {pid} is longer than {MAX_CHAIN_LEN} nodes");
        }

        panic!("traversal visited more than {MAX_PAGE_HOPS} pages");
    }

    /// Page at `level` whose range contains `target`, starting from `start`
    /// (a page at or above `level`). Returns its PID, the observed head and
    /// the head node.
    pub(super) fn seek<'g>(
        &self,
        start: Pid,
        level: u16,
        target: &Separator<K>,
        guard: &'g NodeGuard<'_, '_, K, V>,
    ) -> (Pid, NodePtr<K, V>, &'g Node<K, V>) {
        let mut pid = start;

        for _ in 0..MAX_PAGE_HOPS {
            let head = self.head(pid);
            // SAFETY: loaded from the mapping table under `guard`.
            let node = unsafe { head.get(guard) };
            let here = node.header().level;
            assert!(
                here >= level,
                "seek for level {level} reached {pid} at level {here}"
            );

            match Self::step(pid, node, target, here > level, guard) {
                Step::Here => return (pid, head, node),
                Step::Right(next) | Step::Down(next) => pid = next,
            }
        }

        panic!("seek visited more than {MAX_PAGE_HOPS} pages");
    }

    /// Decide where the page headed by `head` sends a walk towards `target`.
    /// With `descend` unset the walk wants this level and only moves right.
    fn step(
        pid: Pid,
        head: &Node<K, V>,
        target: &Separator<K>,
        descend: bool,
        guard: &NodeGuard<'_, '_, K, V>,
    ) -> Step {
        let mut node = head;

        for _ in 0..MAX_CHAIN_LEN {
            match node.kind() {
                NodeKind::Index(delta) if descend && delta.routes(target) => {
                    return Step::Down(delta.child);
                }

                NodeKind::Split(delta) | NodeKind::SplitInner(delta)
                    if Separator::Finite(delta.key) < *target =>
                {
                    return Step::Right(delta.sidelink);
                }

                NodeKind::Inner(page) if descend => {
                    return page
                        .child_for(target)
                        .map_or_else(|| Step::Right(Self::sibling(pid, page.next)), Step::Down);
                }

                NodeKind::Inner(page) => {
                    let high = page.high().copied().unwrap_or(Separator::Infinity);
                    return if high >= *target {
                        Step::Here
                    } else {
                        Step::Right(Self::sibling(pid, page.next))
                    };
                }

                NodeKind::Leaf(page) => {
                    return if page.high >= *target {
                        Step::Here
                    } else {
                        Step::Right(Self::sibling(pid, page.next))
                    };
                }

                NodeKind::Index(_)
                | NodeKind::Split(_)
                | NodeKind::SplitInner(_)
                | NodeKind::Insert(_)
                | NodeKind::Delete(_) => {}
            }

            node = Self::below(node, guard);
        }

        panic!("chain of {pid} is longer than {MAX_CHAIN_LEN} nodes");
    }

    /// Upper bound and right sibling of the page headed by `head`, counting
    /// an installed split as the page's end.
    pub(super) fn extent(
        pid: Pid,
        head: &Node<K, V>,
        guard: &NodeGuard<'_, '_, K, V>,
    ) -> (Separator<K>, Option<Pid>) {
        let mut node = head;

        for _ in 0..MAX_CHAIN_LEN {
            match node.kind() {
                NodeKind::Split(delta) | NodeKind::SplitInner(delta) => {
                    return (Separator::Finite(delta.key), Some(delta.sidelink));
                }
                NodeKind::Leaf(page) => return (page.high, page.next),
                NodeKind::Inner(page) => {
                    return (page.high().copied().unwrap_or(Separator::Infinity), page.next);
                }
                NodeKind::Index(_) | NodeKind::Insert(_) | NodeKind::Delete(_) => {}
            }

            node = Self::below(node, guard);
        }

        panic!("chain of {pid} is longer than {MAX_CHAIN_LEN} nodes");
    }

    fn sibling(pid: Pid, next: Option<Pid>) -> Pid {
        match next {
            Some(next) => next,
            None => panic!("{pid} is the rightmost page but does not cover the key"),
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
