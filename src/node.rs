//! Page and delta records.
//!
//! A logical page is a chain of immutable [`Node`]s: zero or more deltas,
//! newest first, ending in one base page. The chain head lives in the
//! mapping table; each delta points at the node it was prepended to through
//! its `origin`.
//!
//! Chain links are non-owning [`NodePtr`]s. A chain is owned by whoever holds
//! its head: the mapping table while it is installed, the epoch reclaimer
//! (as a [`RetiredChain`]) once a CAS has replaced it.
//!
//! Every node carries a [`Header`] describing the page *as seen from that
//! node*: entry count, chain depth and level. Headers are derived from the
//! origin when a delta is built, so the chain head alone answers "is this page
//! oversized or overlong".

// Private module: pub(crate) documents intent.
#![allow(clippy::redundant_pub_crate)]

use std::fmt as StdFmt;
use std::ptr::NonNull;
#[cfg(debug_assertions)]
use std::sync::atomic::AtomicU32;

use crate::epoch::{EpochGuard, Reclaim};
use crate::mapping::Pid;
#[cfg(debug_assertions)]
use crate::ordering::RELAXED;

/// Guard type that protects node reads of a tree with keys `K` and values `V`.
pub(crate) type NodeGuard<'h, 'm, K, V> = EpochGuard<'h, 'm, RetiredChain<K, V>>;

#[cfg(debug_assertions)]
const CANARY_LIVE: u32 = 0x4C49_5645;

#[cfg(debug_assertions)]
const CANARY_POISON: u32 = 0xDEAD_BEEF;

// ============================================================================
//  Separator
// ============================================================================

/// Upper bound of a key range.
///
/// Variant order matters: the derived `Ord` puts every `Finite` below
/// `Infinity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Separator<K> {
    Finite(K),
    Infinity,
}

impl<K: Ord> Separator<K> {
    /// Whether `key` lies at or below this bound.
    #[inline(always)]
    pub(crate) fn covers(&self, key: &K) -> bool {
        match self {
            Self::Finite(bound) => key <= bound,
            Self::Infinity => true,
        }
    }
}

// ============================================================================
//  Header
// ============================================================================

/// Summary of the page as seen from one node of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    /// Live records (leaf) or routed children (inner).
    pub(crate) len: usize,

    /// Nodes from this one down to the base page, inclusive.
    pub(crate) depth: u32,

    /// 0 for leaves, parents are one above their children.
    pub(crate) level: u16,
}

impl Header {
    #[inline(always)]
    pub(crate) const fn deltas(self) -> u32 {
        self.depth - 1
    }

    #[inline(always)]
    pub(crate) const fn is_leaf(self) -> bool {
        self.level == 0
    }
}

// ============================================================================
//  Base pages
// ============================================================================

/// Sorted leaf records.
pub(crate) struct LeafPage<K, V> {
    pub(crate) records: Box<[(K, V)]>,
    pub(crate) prev: Option<Pid>,
    pub(crate) next: Option<Pid>,

    /// Keys above this live at `next`.
    pub(crate) high: Separator<K>,
}

impl<K: Ord, V> LeafPage<K, V> {
    #[inline]
    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.records
            .binary_search_by(|(probe, _)| probe.cmp(key))
            .ok()
            .map(|index| &self.records[index].1)
    }
}

/// Sorted `(upper bound, child)` routing entries.
pub(crate) struct InnerPage<K> {
    pub(crate) entries: Box<[(Separator<K>, Pid)]>,
    pub(crate) prev: Option<Pid>,
    pub(crate) next: Option<Pid>,
}

impl<K: Ord> InnerPage<K> {
    /// Child whose range contains `target`: the first entry whose bound is
    /// at least `target`. `None` means the target lies beyond this page.
    #[inline]
    pub(crate) fn child_for(&self, target: &Separator<K>) -> Option<Pid> {
        let index = self.entries.partition_point(|(bound, _)| bound < target);
        self.entries.get(index).map(|&(_, child)| child)
    }

    /// Upper bound of the whole page.
    pub(crate) fn high(&self) -> Option<&Separator<K>> {
        self.entries.last().map(|(bound, _)| bound)
    }
}

// ============================================================================
//  Deltas
// ============================================================================

/// Upsert of one record.
pub(crate) struct DeltaInsert<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,

    /// The key was live in the page this delta was prepended to.
    pub(crate) key_existed_before: bool,
}

/// Tombstone.
pub(crate) struct DeltaDelete<K> {
    pub(crate) key: K,
}

/// Left half of a split: keys above `key` live at `sidelink`.
pub(crate) struct DeltaSplit<K> {
    pub(crate) key: K,
    pub(crate) sidelink: Pid,
    pub(crate) removed: usize,
}

/// Routing update on a parent: `(key_left, key_right]` now lives at
/// `child`, which was split off `old_child`.
pub(crate) struct DeltaIndex<K> {
    pub(crate) key_left: K,
    pub(crate) key_right: Separator<K>,
    pub(crate) child: Pid,
    pub(crate) old_child: Pid,
}

impl<K: Ord> DeltaIndex<K> {
    #[inline]
    pub(crate) fn routes(&self, target: &Separator<K>) -> bool {
        match target {
            Separator::Finite(key) => *key > self.key_left && self.key_right.covers(key),
            Separator::Infinity => self.key_right == Separator::Infinity,
        }
    }
}

// ============================================================================
//  Node
// ============================================================================

/// Payload of a node.
pub(crate) enum NodeKind<K, V> {
    Leaf(LeafPage<K, V>),
    Inner(InnerPage<K>),
    Insert(DeltaInsert<K, V>),
    Delete(DeltaDelete<K>),
    Split(DeltaSplit<K>),
    SplitInner(DeltaSplit<K>),
    Index(DeltaIndex<K>),
}

impl<K, V> NodeKind<K, V> {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Leaf(_) => "leaf",
            Self::Inner(_) => "inner",
            Self::Insert(_) => "deltaInsert",
            Self::Delete(_) => "deltaDelete",
            Self::Split(_) => "deltaSplit",
            Self::SplitInner(_) => "deltaSplitInner",
            Self::Index(_) => "deltaIndex",
        }
    }
}

/// One immutable element of a page chain.
pub(crate) struct Node<K, V> {
    header: Header,
    origin: Option<NodePtr<K, V>>,
    kind: NodeKind<K, V>,

    #[cfg(debug_assertions)]
    canary: AtomicU32,
}

impl<K, V> Node<K, V> {
    fn build(header: Header, origin: Option<NodePtr<K, V>>, kind: NodeKind<K, V>) -> Box<Self> {
        Box::new(Self {
            header,
            origin,
            kind,
            #[cfg(debug_assertions)]
            canary: AtomicU32::new(CANARY_LIVE),
        })
    }

    /// Fresh leaf base page.
    pub(crate) fn leaf(page: LeafPage<K, V>) -> Box<Self> {
        let header = Header {
            len: page.records.len(),
            depth: 1,
            level: 0,
        };
        Self::build(header, None, NodeKind::Leaf(page))
    }

    /// Fresh inner base page at `level` (at least 1).
    pub(crate) fn inner(page: InnerPage<K>, level: u16) -> Box<Self> {
        debug_assert!(level > 0, "inner pages sit above the leaves");
        let header = Header {
            len: page.entries.len(),
            depth: 1,
            level,
        };
        Self::build(header, None, NodeKind::Inner(page))
    }

    /// Delta to be prepended to `origin`, whose header is `below`.
    pub(crate) fn delta(origin: NodePtr<K, V>, below: Header, kind: NodeKind<K, V>) -> Box<Self> {
        let len = match &kind {
            NodeKind::Insert(delta) if !delta.key_existed_before => below.len + 1,
            NodeKind::Insert(_) => below.len,
            NodeKind::Delete(_) => below.len.saturating_sub(1),
            NodeKind::Split(delta) | NodeKind::SplitInner(delta) => {
                below.len.saturating_sub(delta.removed)
            }
            NodeKind::Index(_) => below.len + 1,
            NodeKind::Leaf(_) | NodeKind::Inner(_) => {
                panic!("base page {} used as a delta", kind.name())
            }
        };

        let header = Header {
            len,
            depth: below.depth + 1,
            level: below.level,
        };
        Self::build(header, Some(origin), kind)
    }

    #[inline(always)]
    pub(crate) const fn header(&self) -> Header {
        self.header
    }

    #[inline(always)]
    pub(crate) const fn origin(&self) -> Option<NodePtr<K, V>> {
        self.origin
    }

    #[inline(always)]
    pub(crate) const fn kind(&self) -> &NodeKind<K, V> {
        &self.kind
    }

    /// Unwrap an unpublished node, e.g. to recover an insert's value after a
    /// lost CAS.
    pub(crate) fn into_kind(self: Box<Self>) -> NodeKind<K, V> {
        self.kind
    }

    #[cfg(debug_assertions)]
    fn check_canary(&self) {
        let canary = self.canary.load(RELAXED);
        assert!(
            canary == CANARY_LIVE,
            "{} node read after reclamation (canary {canary:#x})",
            self.kind.name()
        );
    }

    #[cfg(debug_assertions)]
    fn poison(&self) {
        self.canary.store(CANARY_POISON, RELAXED);
    }
}

// ============================================================================
//  NodePtr
// ============================================================================

/// Non-owning pointer to a node.
pub(crate) struct NodePtr<K, V>(NonNull<Node<K, V>>);

impl<K, V> NodePtr<K, V> {
    /// Give up ownership of `node`. The caller now owns it through the
    /// returned pointer until it is published, freed or retired.
    pub(crate) fn leak(node: Box<Node<K, V>>) -> Self {
        Self(NonNull::from(Box::leak(node)))
    }

    #[inline(always)]
    pub(crate) const fn from_raw(ptr: NonNull<Node<K, V>>) -> Self {
        Self(ptr)
    }

    #[inline(always)]
    pub(crate) const fn as_raw(self) -> NonNull<Node<K, V>> {
        self.0
    }

    /// Borrow the node for as long as `guard` stays pinned.
    ///
    /// # Safety
    ///
    /// The pointer must have been read from the mapping table (directly or
    /// through `origin` links) while `guard` was pinned, or be owned by the
    /// caller.
    #[inline(always)]
    pub(crate) unsafe fn get<'g, T: Reclaim>(self, _guard: &'g EpochGuard<'_, '_, T>) -> &'g Node<K, V> {
        // SAFETY: the epoch guard keeps unlinked chains alive while pinned.
        let node = unsafe { self.0.as_ref() };
        #[cfg(debug_assertions)]
        node.check_canary();
        node
    }

    /// Take back ownership of the node.
    ///
    /// # Safety
    ///
    /// Nobody else may reach the node: it was never published, or it has
    /// been unlinked and no reader can still hold it.
    pub(crate) unsafe fn reclaim(self) -> Box<Node<K, V>> {
        // SAFETY: exclusive ownership per the caller; allocated by `leak`.
        unsafe { Box::from_raw(self.0.as_ptr()) }
    }
}

impl<K, V> Clone for NodePtr<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for NodePtr<K, V> {}

impl<K, V> PartialEq for NodePtr<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<K, V> Eq for NodePtr<K, V> {}

impl<K, V> StdFmt::Debug for NodePtr<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "NodePtr({:p})", self.0)
    }
}

/// Free `head` and every node below it.
///
/// # Safety
///
/// The whole chain must be exclusively owned by the caller.
pub(crate) unsafe fn free_chain<K, V>(head: NodePtr<K, V>) {
    let mut cursor = Some(head);

    while let Some(ptr) = cursor {
        // SAFETY: the caller owns every node of the chain.
        let node = unsafe { ptr.reclaim() };
        cursor = node.origin;
    }
}

// ============================================================================
//  RetiredChain
// ============================================================================

/// A whole unlinked chain, released as one unit by the reclaimer.
pub(crate) struct RetiredChain<K, V> {
    head: NodePtr<K, V>,
}

impl<K, V> RetiredChain<K, V> {
    /// # Safety
    ///
    /// A successful CAS must just have unlinked `head`, and nothing else may
    /// retire or free any node of its chain.
    pub(crate) const unsafe fn new(head: NodePtr<K, V>) -> Self {
        Self { head }
    }
}

// SAFETY: the reclaimer is the only owner of a retired chain; sending it
// moves the contained keys and values.
unsafe impl<K: Send, V: Send> Send for RetiredChain<K, V> {}

impl<K: Send, V: Send> Reclaim for RetiredChain<K, V> {
    #[cfg(debug_assertions)]
    fn poison(&mut self) {
        let mut cursor = Some(self.head);

        while let Some(ptr) = cursor {
            // SAFETY: still allocated; the quarantine frees it later.
            let node = unsafe { ptr.as_raw().as_ref() };
            node.poison();
            cursor = node.origin;
        }
    }
}

impl<K, V> Drop for RetiredChain<K, V> {
    fn drop(&mut self) {
        // SAFETY: ownership of the chain was transferred in `new`.
        unsafe { free_chain(self.head) };
    }
}

// ============================================================================
//  Tests
// ============================================================================
