//! Point operations and the maintenance they trigger.
//!
//! Writers build one delta against the chain head the traversal observed and
//! try to install it with a single CAS. Losing the CAS means somebody else
//! changed the page first: the delta is taken back and the whole operation
//! starts over from the root. Correctness rests only on the expected value of
//! that CAS being the exact head the lookup ran against.
//!
//! After the operation, still pinned, the caller runs whatever maintenance
//! the traversal flagged: at most one inner page and the target leaf.

use super::BwTree;
use super::handle::{Pinned, TreeHandle};
use super::traverse::{Candidate, Maintenance};
use crate::node::{DeltaDelete, DeltaInsert, Node, NodeKind, NodePtr};
use crate::tracing_helpers::trace_log;

impl<K, V> BwTree<K, V>
where
    K: Ord + Copy + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Value stored under `key`.
    ///
    /// # Panics
    ///
    /// If `handle` was created by another tree.
    pub fn search(&self, key: &K, handle: &mut TreeHandle<'_, K, V>) -> Option<V> {
        self.check_handle(handle);
        let mut pinned = handle.pin();

        let page = self.find_data_page(key, &pinned.guard, pinned.rng, pinned.scratch);
        let value = page.record.cloned();
        let (pid, header, inner) = (page.pid, page.header, page.inner_candidate);

        let leaf = self.assess(pid, header, pinned.rng);
        self.maintain(leaf, inner, &mut pinned);
        value
    }

    /// Insert `key`, replacing any value already stored under it.
    ///
    /// # Panics
    ///
    /// If `handle` was created by another tree.
    pub fn insert(&self, key: K, value: V, handle: &mut TreeHandle<'_, K, V>) {
        self.check_handle(handle);
        let mut pinned = handle.pin();
        let mut value = value;

        let (pid, header, inner) = loop {
            let page = self.find_data_page(&key, &pinned.guard, pinned.rng, pinned.scratch);
            let delta = Node::delta(
                page.head,
                page.header,
                NodeKind::Insert(DeltaInsert {
                    key,
                    value,
                    key_existed_before: page.record.is_some(),
                }),
            );
            let header = delta.header();
            let delta = NodePtr::leak(delta);

            if self.install(page.pid, page.head, delta) {
                break (page.pid, header, page.inner_candidate);
            }

            self.stats.record_collision();
            trace_log!(pid = %page.pid, "insert lost its CAS, retrying");

            // SAFETY: the CAS failed, the delta was never published.
            let NodeKind::Insert(lost) = unsafe { delta.reclaim() }.into_kind() else {
                unreachable!("an insert delta came back as something else");
            };
            value = lost.value;
        };

        let leaf = self.assess(pid, header, pinned.rng);
        self.maintain(leaf, inner, &mut pinned);
    }

    /// Remove `key`. Returns whether it was present; removing an absent key
    /// changes nothing.
    ///
    /// # Panics
    ///
    /// If `handle` was created by another tree.
    pub fn delete_key(&self, key: &K, handle: &mut TreeHandle<'_, K, V>) -> bool {
        self.check_handle(handle);
        let mut pinned = handle.pin();

        let (pid, header, inner, deleted) = loop {
            let page = self.find_data_page(key, &pinned.guard, pinned.rng, pinned.scratch);
            if page.record.is_none() {
                break (page.pid, page.header, page.inner_candidate, false);
            }

            let delta = Node::delta(page.head, page.header, NodeKind::Delete(DeltaDelete { key: *key }));
            let header = delta.header();
            let delta = NodePtr::leak(delta);

            if self.install(page.pid, page.head, delta) {
                break (page.pid, header, page.inner_candidate, true);
            }

            self.stats.record_collision();
            trace_log!(pid = %page.pid, "delete lost its CAS, retrying");

            // SAFETY: the CAS failed, the delta was never published.
            drop(unsafe { delta.reclaim() });
        };

        let leaf = self.assess(pid, header, pinned.rng);
        self.maintain(leaf, inner, &mut pinned);
        deleted
    }

    /// Run flagged maintenance: the leaf first, then the inner page.
    fn maintain(
        &self,
        leaf: Option<Candidate>,
        inner: Option<Candidate>,
        pinned: &mut Pinned<'_, '_, K, V>,
    ) {
        for candidate in [leaf, inner].into_iter().flatten() {
            match candidate.action {
                Maintenance::Consolidate => {
                    self.consolidate(candidate.pid, &pinned.guard, pinned.scratch);
                }

                Maintenance::Split => {
                    let parent = pinned.scratch.parent_of(candidate.level);
                    self.split(candidate.pid, parent, &pinned.guard, pinned.scratch);
                }
            }
        }
    }

    pub(super) fn check_handle(&self, handle: &TreeHandle<'_, K, V>) {
        assert!(
            handle.belongs_to(self),
            "TreeHandle used with a tree other than the one that created it"
        );
    }
}

// ============================================================================
//  Tests
// ============================================================================
