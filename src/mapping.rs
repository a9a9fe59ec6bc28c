//! The mapping table: logical page ids to chain heads.
//!
//! Every page of the tree is addressed by a [`Pid`]. Parents, sibling links
//! and split deltas store PIDs, never raw pointers, so a page can be replaced
//! wholesale (a new delta, a consolidated base page) with one CAS on its slot
//! without touching anything that refers to it.
//!
//! The table has a fixed capacity chosen at construction. PIDs come from a
//! monotonically increasing cursor and are never reused, not even when a slot
//! is [`abandon`](MappingTable::abandon)ed.

use std::fmt as StdFmt;
use std::ptr::{self as StdPtr, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

// ============================================================================
//  Pid
// ============================================================================

/// Stable logical identifier of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(usize);

impl Pid {
    #[inline(always)]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Slot index of this page in the mapping table.
    #[must_use]
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl StdFmt::Display for Pid {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

// ============================================================================
//  MappingTableFull
// ============================================================================

/// Every slot of the mapping table has been handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingTableFull {
    /// Capacity of the exhausted table.
    pub capacity: usize,
}

impl StdFmt::Display for MappingTableFull {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "mapping table exhausted: all {} page ids are in use", self.capacity)
    }
}

impl std::error::Error for MappingTableFull {}

// ============================================================================
//  MappingTable
// ============================================================================

/// Fixed-capacity array of atomically swappable page pointers.
///
/// The table never dereferences or frees what it stores. Ownership of the
/// pointees is the caller's business: the tree owns whatever is installed,
/// and [`drain`](Self::drain) hands everything back at teardown.
pub struct MappingTable<T> {
    slots: Box<[AtomicPtr<T>]>,
    cursor: AtomicUsize,
}

impl<T> MappingTable<T> {
    /// Create a table with room for `capacity` pages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(StdPtr::null_mut()))
            .collect();

        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Reserve the next PID and publish `node` in its slot.
    ///
    /// # Errors
    ///
    /// [`MappingTableFull`] once every slot has been reserved. The cursor
    /// stays past the end so later calls fail the same way.
    pub fn allocate(&self, node: NonNull<T>) -> Result<Pid, MappingTableFull> {
        let index = self.cursor.fetch_add(1, RELAXED);
        let Some(slot) = self.slots.get(index) else {
            return Err(MappingTableFull {
                capacity: self.slots.len(),
            });
        };

        slot.store(node.as_ptr(), WRITE_ORD);
        Ok(Pid::from_index(index))
    }

    /// Current chain head of `pid`, `None` for an abandoned slot.
    ///
    /// # Panics
    ///
    /// If `pid` was never handed out by this table.
    #[must_use]
    #[inline(always)]
    pub fn read(&self, pid: Pid) -> Option<NonNull<T>> {
        NonNull::new(self.slot(pid).load(READ_ORD))
    }

    /// Swing `pid` from `expected` to `new`. Returns `false` without side
    /// effects if the slot no longer holds `expected`.
    #[must_use]
    #[inline(always)]
    pub fn try_replace(&self, pid: Pid, expected: NonNull<T>, new: NonNull<T>) -> bool {
        self.slot(pid)
            .compare_exchange(expected.as_ptr(), new.as_ptr(), CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Clear a slot whose page never became reachable.
    ///
    /// The PID stays consumed. Returns `false` if the slot did not hold
    /// `expected`.
    pub fn abandon(&self, pid: Pid, expected: NonNull<T>) -> bool {
        self.slot(pid)
            .compare_exchange(
                expected.as_ptr(),
                StdPtr::null_mut(),
                CAS_SUCCESS,
                CAS_FAILURE,
            )
            .is_ok()
    }

    /// Number of PIDs handed out so far (abandoned ones included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursor.load(RELAXED).min(self.slots.len())
    }

    /// Whether no PID has been handed out yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Take every installed pointer out of the table, leaving it empty.
    pub fn drain(&mut self) -> impl Iterator<Item = NonNull<T>> + '_ {
        let used = self.len();

        self.slots[..used]
            .iter_mut()
            .filter_map(|slot| NonNull::new(std::mem::replace(slot.get_mut(), StdPtr::null_mut())))
    }

    #[inline(always)]
    fn slot(&self, pid: Pid) -> &AtomicPtr<T> {
        match self.slots.get(pid.index()) {
            Some(slot) => slot,
            None => panic!(
                "{pid} is outside the mapping table (capacity {})",
                self.slots.len()
            ),
        }
    }
}

impl<T> StdFmt::Debug for MappingTable<T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("MappingTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================
