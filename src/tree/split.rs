//! Page splits and their propagation upwards.
//!
//! A split happens in two steps, each a single CAS:
//!
//! 1. A split delta on the original page hands every key above the split key
//!    to a freshly allocated right sibling. From this point on the tree is
//!    consistent: readers reach the sibling through the sidelink.
//! 2. The parent learns about the sibling through an index delta, or, when
//!    the original page sat at the root level, a new root is built over the
//!    whole level.
//!
//! Step 2 retries until it succeeds. Step 1 is abandoned on its first
//! failure; the right page was never reachable and is freed on the spot.

use super::handle::Scratch;
use super::{BwTree, MAX_PAGE_HOPS};
use crate::mapping::Pid;
use crate::node::{
    DeltaIndex, DeltaSplit, InnerPage, LeafPage, Node, NodeGuard, NodeKind, NodePtr, Separator,
};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS};
use crate::stats::PageClass;
use crate::tracing_helpers::{debug_log, trace_log, warn_log};

/// An installed split that the level above does not know about yet.
struct PendingPost<K> {
    left: Pid,
    right: Pid,

    /// Greatest key kept on the left.
    key: K,

    /// Upper bound of the page before the split.
    old_high: Separator<K>,
    level: u16,
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Copy + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Split `pid` if it still holds more entries than its level allows.
    ///
    /// `parent` is the page one level up the caller walked through, if any.
    /// Returns whether a split was installed.
    pub(super) fn split(
        &self,
        pid: Pid,
        parent: Option<Pid>,
        guard: &NodeGuard<'_, '_, K, V>,
        scratch: &mut Scratch<K, V>,
    ) -> bool {
        let head = self.head(pid);
        // SAFETY: loaded from the mapping table under `guard`.
        let node = unsafe { head.get(guard) };
        let header = node.header();
        let threshold = self.settings.split_threshold(header.level);
        if header.len <= threshold {
            return false;
        }

        let class = PageClass::of_level(header.level);
        let (right, key, removed, old_high) = if header.is_leaf() {
            let bounds = Self::collect_leaf(pid, node, guard, scratch);
            let count = scratch.records.len();
            if count <= threshold {
                return false;
            }

            let mid = count / 2;
            let key = scratch.records[mid - 1].0;
            let right = Node::leaf(LeafPage {
                records: scratch.records.drain(mid..).collect(),
                prev: Some(pid),
                next: bounds.next,
                high: bounds.high,
            });
            (right, key, count - mid, bounds.high)
        } else {
            let Some(bounds) = Self::collect_inner(pid, node, guard, scratch) else {
                debug_log!(%pid, "inner split deferred: an index post is pending");
                return false;
            };
            let count = scratch.entries.len();
            if count <= threshold {
                // Duplicate index posts inflate the header; a rebuild
                // brings the count back in line.
                self.consolidate(pid, guard, scratch);
                return false;
            }

            let mid = count / 2;
            let Separator::Finite(key) = scratch.entries[mid - 1].0 else {
                panic!("{pid} routes to +infinity before its last entry");
            };
            let right = Node::inner(
                InnerPage {
                    entries: scratch.entries.drain(mid..).collect(),
                    prev: Some(pid),
                    next: bounds.next,
                },
                header.level,
            );
            (right, key, count - mid, bounds.high)
        };

        let right = NodePtr::leak(right);
        let right_pid = self.allocate(right);

        let split = DeltaSplit {
            key,
            sidelink: right_pid,
            removed,
        };
        let kind = if header.is_leaf() {
            NodeKind::Split(split)
        } else {
            NodeKind::SplitInner(split)
        };
        let delta = NodePtr::leak(Node::delta(head, header, kind));

        if !self.install(pid, head, delta) {
            self.stats.record_split(class, false);
            warn_log!(%pid, right = %right_pid, "split lost its CAS, abandoning the right page");
            // SAFETY: the CAS failed, the delta was never published.
            drop(unsafe { delta.reclaim() });
            self.discard_unreachable(right_pid, right);
            return false;
        }

        self.stats.record_split(class, true);
        debug_log!(%pid, right = %right_pid, level = header.level, moved = removed, "page split");

        self.publish_split(
            PendingPost {
                left: pid,
                right: right_pid,
                key,
                old_high,
                level: header.level,
            },
            parent,
            guard,
        );
        true
    }

    /// Make the level above route to the new right page. Retries until an
    /// index delta or a new root is installed.
    fn publish_split(
        &self,
        post: PendingPost<K>,
        parent: Option<Pid>,
        guard: &NodeGuard<'_, '_, K, V>,
    ) {
        let mut parent = parent;

        loop {
            let start = match parent {
                Some(pid) => pid,
                None => {
                    let root = self.root_pid();
                    // SAFETY: loaded from the mapping table under `guard`.
                    let root_level = unsafe { self.head(root).get(guard) }.header().level;

                    if root_level == post.level {
                        if self.grow_root(root, post.level, guard) {
                            return;
                        }
                        // Somebody else raised the root; post below it.
                        continue;
                    }
                    root
                }
            };

            let (target, head, node) = self.seek(start, post.level + 1, &post.old_high, guard);
            let delta = NodePtr::leak(Node::delta(
                head,
                node.header(),
                NodeKind::Index(DeltaIndex {
                    key_left: post.key,
                    key_right: post.old_high,
                    child: post.right,
                    old_child: post.left,
                }),
            ));

            if self.install(target, head, delta) {
                self.stats.record_index_post();
                debug_log!(parent = %target, child = %post.right, "index delta posted");
                return;
            }

            self.stats.record_collision();
            trace_log!(parent = %target, "index post lost its CAS, retrying");
            // SAFETY: the CAS failed, the delta was never published.
            drop(unsafe { delta.reclaim() });
            parent = Some(target);
        }
    }

    /// Install a new root one level above `old_root`, routing to every page
    /// of the old root's level. Fails when the root has moved on.
    fn grow_root(&self, old_root: Pid, level: u16, guard: &NodeGuard<'_, '_, K, V>) -> bool {
        let mut entries = Vec::new();
        let mut pid = old_root;

        loop {
            // SAFETY: loaded from the mapping table under `guard`.
            let node = unsafe { self.head(pid).get(guard) };
            let (high, next) = Self::extent(pid, node, guard);
            entries.push((high, pid));

            let Some(next) = next else {
                break;
            };
            assert!(
                entries.len() < MAX_PAGE_HOPS,
                "level {level} has more than {MAX_PAGE_HOPS} pages"
            );
            pid = next;
        }

        if let Some(last) = entries.last_mut() {
            last.0 = Separator::Infinity;
        }

        let root = NodePtr::leak(Node::inner(
            InnerPage {
                entries: entries.into_boxed_slice(),
                prev: None,
                next: None,
            },
            level + 1,
        ));
        let root_pid = self.allocate(root);

        let swapped = self
            .root
            .compare_exchange(old_root.index(), root_pid.index(), CAS_SUCCESS, CAS_FAILURE)
            .is_ok();
        if !swapped {
            trace_log!(%old_root, "root growth lost its CAS");
            self.discard_unreachable(root_pid, root);
            return false;
        }

        self.stats.record_root_growth();
        debug_log!(root = %root_pid, level = level + 1, "root grown");
        true
    }
}

// ============================================================================
//  Tests
// ============================================================================
