//! Epoch-based reclamation for unlinked delta chains.
//!
//! Readers never take locks, so a chain that a CAS has just unlinked may
//! still be under some other thread's feet. The reclaimer defers its release
//! until that can no longer be the case:
//!
//! 1. Every operation [`pin`](EpochHandle::pin)s: it announces the current
//!    global epoch in its participant slot before touching the tree.
//! 2. Whoever unlinks a chain [`retire`](EpochGuard::retire)s it, tagged with
//!    the global epoch read *after* the unlinking CAS.
//! 3. An item is released once every active participant announces an epoch
//!    strictly newer than its tag. A reader that could still hold a pointer
//!    into the chain pinned before the unlink, so its announcement is at most
//!    the tag.
//!
//! The global epoch advances every `advance_interval` unpins of a handle, and
//! a handle scans its own garbage once it holds `collect_threshold` items.
//! All announcement, advance and scan accesses are sequentially consistent.
//!
//! In debug builds released items are [`poison`](Reclaim::poison)ed and
//! parked in a quarantine until the manager drops, so a premature release
//! shows up as a canary failure instead of a use-after-free.

mod deletion_list;

use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering, fence};

use parking_lot::{Mutex, RwLock};

use self::deletion_list::DeletionList;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, EPOCH_ORD, RELAXED};

/// Monotone reclamation epoch.
pub type Epoch = u64;

/// Announcement of a participant that is not inside an operation.
const INACTIVE: Epoch = Epoch::MAX;

// ============================================================================
//  Reclaim
// ============================================================================

/// Something that can be handed to the reclaimer.
///
/// Dropping the value releases it. `poison` runs first in debug builds.
pub trait Reclaim: Send {
    /// Mark the value dead. Only called in debug builds, right before the
    /// value moves to the quarantine.
    fn poison(&mut self) {}
}

// ============================================================================
//  EpochConfig
// ============================================================================

/// Tuning knobs of the reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochConfig {
    /// Advance the global epoch every this many unpins of one handle.
    pub advance_interval: u64,

    /// Scan a handle's garbage once it holds at least this many items.
    pub collect_threshold: usize,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            advance_interval: 64,
            collect_threshold: 64,
        }
    }
}

// ============================================================================
//  Participant
// ============================================================================

struct Participant<T> {
    local: AtomicU64,
    claimed: AtomicBool,
    garbage: Mutex<DeletionList<T>>,
}

impl<T> Participant<T> {
    fn claimed() -> Self {
        Self {
            local: AtomicU64::new(INACTIVE),
            claimed: AtomicBool::new(true),
            garbage: Mutex::new(DeletionList::new()),
        }
    }
}

// ============================================================================
//  EpochManager
// ============================================================================

/// Global epoch, participant registry and shared garbage.
pub struct EpochManager<T: Reclaim> {
    global: AtomicU64,
    participants: RwLock<Vec<Arc<Participant<T>>>>,

    /// Garbage left behind by dropped handles.
    orphans: Mutex<DeletionList<T>>,
    config: EpochConfig,

    retired: AtomicU64,
    reclaimed: AtomicU64,

    #[cfg(debug_assertions)]
    quarantine: Mutex<Vec<T>>,
}

impl<T: Reclaim> EpochManager<T> {
    /// Create a manager starting at epoch 0 with no participants.
    ///
    /// # Panics
    ///
    /// If `config.advance_interval` is zero.
    #[must_use]
    pub fn new(config: EpochConfig) -> Self {
        assert!(config.advance_interval > 0, "epoch advance interval must be positive");

        Self {
            global: AtomicU64::new(0),
            participants: RwLock::new(Vec::new()),
            orphans: Mutex::new(DeletionList::new()),
            config,
            retired: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            #[cfg(debug_assertions)]
            quarantine: Mutex::new(Vec::new()),
        }
    }

    /// Join as a participant. Slots of dropped handles are reused.
    pub fn register(&self) -> EpochHandle<'_, T> {
        let reused = self
            .participants
            .read()
            .iter()
            .find(|slot| {
                slot.claimed
                    .compare_exchange(false, true, CAS_SUCCESS, CAS_FAILURE)
                    .is_ok()
            })
            .cloned();

        let slot = reused.unwrap_or_else(|| {
            let slot = Arc::new(Participant::claimed());
            self.participants.write().push(Arc::clone(&slot));
            slot
        });

        EpochHandle {
            manager: self,
            slot,
            unpins: 0,
        }
    }

    /// Current global epoch.
    #[must_use]
    pub fn global_epoch(&self) -> Epoch {
        self.global.load(EPOCH_ORD)
    }

    /// Oldest epoch announced by a pinned participant, `None` if nobody is
    /// pinned.
    #[must_use]
    pub fn oldest_active(&self) -> Option<Epoch> {
        let oldest = self.oldest_announcement();
        (oldest != INACTIVE).then_some(oldest)
    }

    /// Number of registered participant slots, claimed or not.
    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.read().len()
    }

    /// Items handed to [`EpochGuard::retire`] so far.
    #[must_use]
    pub fn retired_count(&self) -> u64 {
        self.retired.load(RELAXED)
    }

    /// Items released so far.
    #[must_use]
    pub fn reclaimed_count(&self) -> u64 {
        self.reclaimed.load(RELAXED)
    }

    fn oldest_announcement(&self) -> Epoch {
        self.participants
            .read()
            .iter()
            .map(|slot| slot.local.load(EPOCH_ORD))
            .min()
            .unwrap_or(INACTIVE)
    }

    /// Release whatever in `own` (and, if uncontended, the orphan list) is
    /// older than every announcement.
    fn collect(&self, own: &mut DeletionList<T>) -> usize {
        let oldest = self.oldest_announcement();
        let mut released = own.release_before(oldest, |item| self.dispose(item));

        if let Some(mut orphans) = self.orphans.try_lock() {
            released += orphans.release_before(oldest, |item| self.dispose(item));
        }

        self.reclaimed.fetch_add(released as u64, RELAXED);
        released
    }

    #[cfg(debug_assertions)]
    fn dispose(&self, mut item: T) {
        item.poison();
        self.quarantine.lock().push(item);
    }

    #[cfg(not(debug_assertions))]
    #[allow(clippy::unused_self)]
    fn dispose(&self, item: T) {
        drop(item);
    }
}

impl<T: Reclaim> Drop for EpochManager<T> {
    fn drop(&mut self) {
        // Every handle borrows the manager, so nothing is pinned any more.
        for slot in self.participants.get_mut().iter() {
            slot.garbage.lock().drain_all(drop);
        }
        self.orphans.get_mut().drain_all(drop);
    }
}

impl<T: Reclaim> StdFmt::Debug for EpochManager<T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("EpochManager")
            .field("global", &self.global_epoch())
            .field("participants", &self.participant_count())
            .field("retired", &self.retired_count())
            .field("reclaimed", &self.reclaimed_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  EpochHandle
// ============================================================================

/// One thread's registration with an [`EpochManager`].
///
/// Dropping the handle announces that the thread is done: its slot goes
/// inactive, whatever garbage cannot be released yet moves to the shared
/// orphan list, and the slot becomes available to the next registration.
pub struct EpochHandle<'m, T: Reclaim> {
    manager: &'m EpochManager<T>,
    slot: Arc<Participant<T>>,
    unpins: u64,
}

impl<'m, T: Reclaim> EpochHandle<'m, T> {
    /// Enter an operation. Pointers loaded while the guard lives stay valid
    /// until it drops.
    pub fn pin(&mut self) -> EpochGuard<'_, 'm, T> {
        let epoch = self.manager.global.load(EPOCH_ORD);
        self.slot.local.store(epoch, EPOCH_ORD);
        // Order the announcement before any pointer load of the operation.
        fence(EPOCH_ORD);

        EpochGuard {
            handle: self,
            epoch,
        }
    }

    /// Release every item of this handle that is already safe to release.
    pub fn flush(&mut self) -> usize {
        let mut garbage = self.slot.garbage.lock();
        self.manager.collect(&mut garbage)
    }

    /// Items retired through this handle and not released yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slot.garbage.lock().len()
    }

    fn unpin(&mut self) {
        self.slot.local.store(INACTIVE, EPOCH_ORD);

        self.unpins = self.unpins.wrapping_add(1);
        if self.unpins.is_multiple_of(self.manager.config.advance_interval) {
            self.manager.global.fetch_add(1, EPOCH_ORD);
        }

        let mut garbage = self.slot.garbage.lock();
        if garbage.len() >= self.manager.config.collect_threshold {
            self.manager.collect(&mut garbage);
        }
    }
}

impl<T: Reclaim> Drop for EpochHandle<'_, T> {
    fn drop(&mut self) {
        self.slot.local.store(INACTIVE, EPOCH_ORD);

        let mut garbage = self.slot.garbage.lock();
        self.manager.collect(&mut garbage);
        if !garbage.is_empty() {
            self.manager.orphans.lock().append(&mut garbage);
        }
        drop(garbage);

        self.slot.claimed.store(false, AtomicOrdering::Release);
    }
}

impl<T: Reclaim> StdFmt::Debug for EpochHandle<'_, T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("EpochHandle")
            .field("local", &self.slot.local.load(RELAXED))
            .field("unpins", &self.unpins)
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  EpochGuard
// ============================================================================

/// Proof that the owning handle is pinned. Unpins on drop.
pub struct EpochGuard<'h, 'm, T: Reclaim> {
    handle: &'h mut EpochHandle<'m, T>,
    epoch: Epoch,
}

impl<T: Reclaim> EpochGuard<'_, '_, T> {
    /// Epoch announced when this guard was created.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Defer the release of `item`, which the caller has just made
    /// unreachable for operations that pin from now on.
    pub fn retire(&self, item: T) {
        // Order the unlinking CAS before the tag read.
        fence(EPOCH_ORD);
        let tag = self.handle.manager.global.load(EPOCH_ORD);

        self.handle.slot.garbage.lock().push(tag, item);
        self.handle.manager.retired.fetch_add(1, RELAXED);
    }
}

impl<T: Reclaim> Drop for EpochGuard<'_, '_, T> {
    fn drop(&mut self) {
        self.handle.unpin();
    }
}

// ============================================================================
//  Tests
// ============================================================================
