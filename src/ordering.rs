//! Standard memory orderings for mapping-table and epoch access.
//!
//! These constants keep ordering usage consistent across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for loading a chain head out of a mapping slot.
/// Pairs with the Release half of the CAS that published it.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for storing a freshly allocated page into an unused slot.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success on a mapping slot or the root PID.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for statistics counters and the PID cursor.
/// Nothing is published through them.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for epoch announcements, the global epoch and the
/// oldest-active scan. The reclaimer's safety argument needs a single
/// total order over all of them.
pub const EPOCH_ORD: Ordering = Ordering::SeqCst;
