//! Per-participant garbage, grouped by retirement epoch.

// Private module: pub(crate) documents intent.
#![allow(clippy::redundant_pub_crate)]

use super::Epoch;

/// Items retired in the same epoch.
struct Bag<T> {
    epoch: Epoch,
    items: Vec<T>,
}

/// Growable list of retired items keyed by the epoch they were retired in.
///
/// Retirements arrive in non-decreasing epoch order from a single
/// participant, so consecutive items share a bag. Lists merged from other
/// participants (see [`append`](Self::append)) may interleave epochs; the
/// release scan therefore looks at every bag rather than stopping at the
/// first young one.
///
/// Emptied bag buffers are kept and reused so a steady workload stops
/// allocating once the list has warmed up.
pub(crate) struct DeletionList<T> {
    bags: Vec<Bag<T>>,
    spare: Vec<Vec<T>>,
    len: usize,
}

impl<T> DeletionList<T> {
    pub(crate) const fn new() -> Self {
        Self {
            bags: Vec::new(),
            spare: Vec::new(),
            len: 0,
        }
    }

    /// Total number of items waiting to be released.
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record `item` as retired during `epoch`.
    pub(crate) fn push(&mut self, epoch: Epoch, item: T) {
        self.len += 1;

        if let Some(bag) = self.bags.last_mut()
            && bag.epoch == epoch
        {
            bag.items.push(item);
            return;
        }

        let mut items = self.spare.pop().unwrap_or_default();
        items.push(item);
        self.bags.push(Bag { epoch, items });
    }

    /// Hand every item retired strictly before `oldest_active` to `release`.
    ///
    /// Returns the number of items released.
    pub(crate) fn release_before(&mut self, oldest_active: Epoch, mut release: impl FnMut(T)) -> usize {
        let mut released = 0;
        let mut index = 0;

        while index < self.bags.len() {
            if self.bags[index].epoch < oldest_active {
                let mut bag = self.bags.swap_remove(index);
                released += bag.items.len();
                bag.items.drain(..).for_each(&mut release);
                self.spare.push(bag.items);
            } else {
                index += 1;
            }
        }

        self.len -= released;
        released
    }

    /// Move every item of `other` into `self`, keeping their epochs.
    pub(crate) fn append(&mut self, other: &mut Self) {
        self.len += other.len;
        other.len = 0;
        self.bags.append(&mut other.bags);
    }

    /// Hand every item to `release` regardless of epoch.
    pub(crate) fn drain_all(&mut self, mut release: impl FnMut(T)) {
        for mut bag in self.bags.drain(..) {
            bag.items.drain(..).for_each(&mut release);
        }
        self.len = 0;
    }
}

// ============================================================================
//  Tests
// ============================================================================
