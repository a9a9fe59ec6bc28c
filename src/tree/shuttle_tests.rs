//! Shuttle schedule exploration for the delta-chain protocol.
//!
//! Shuttle runs each scenario under many randomized thread schedules. The
//! tree itself uses std atomics that shuttle cannot intercept, so these tests
//! drive a small model of one logical page that keeps the real protocol:
//! prepend a delta with one CAS against the observed head, retry from scratch
//! on failure, consolidate by CAS-installing a rebuilt base, split by
//! CAS-installing a split delta that points at a pre-built right page.
//!
//! Run with: `cargo test --lib tree::shuttle_tests`

#![expect(clippy::unwrap_used, reason = "Fail fast in tests")]

use shuttle::sync::atomic::{AtomicUsize, Ordering};
use shuttle::sync::{Arc, Mutex};
use shuttle::thread;

// ============================================================================
//  Model
// ============================================================================

#[derive(Clone)]
enum ModelNode {
    Base { records: Vec<(u64, u64)>, high: u64, next: Option<usize> },
    Insert { key: u64, value: u64, origin: usize },
    Delete { key: u64, origin: usize },
    Split { key: u64, sidelink: usize, origin: usize },
}

/// Two mapping slots (left and right page) over an append-only node arena.
/// Arena indices stand in for node pointers; nothing is ever freed.
struct ModelPages {
    arena: Mutex<Vec<ModelNode>>,
    slots: [AtomicUsize; 2],
    collisions: AtomicUsize,
}

impl ModelPages {
    fn new() -> Self {
        let base = ModelNode::Base {
            records: Vec::new(),
            high: u64::MAX,
            next: None,
        };
        Self {
            arena: Mutex::new(vec![base]),
            slots: [AtomicUsize::new(0), AtomicUsize::new(usize::MAX)],
            collisions: AtomicUsize::new(0),
        }
    }

    fn push(&self, node: ModelNode) -> usize {
        let mut arena = self.arena.lock().unwrap();
        arena.push(node);
        arena.len() - 1
    }

    fn node(&self, index: usize) -> ModelNode {
        self.arena.lock().unwrap()[index].clone()
    }

    fn cas(&self, slot: usize, expected: usize, new: usize) -> bool {
        let ok = self.slots[slot]
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !ok {
            self.collisions.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Slot owning `key` and its head, plus the key's live value.
    fn find(&self, key: u64) -> (usize, usize, Option<u64>) {
        let mut slot = 0;

        'pages: loop {
            let head = self.slots[slot].load(Ordering::Acquire);
            let mut cursor = head;

            loop {
                match self.node(cursor) {
                    ModelNode::Insert { key: k, value, .. } if k == key => {
                        return (slot, head, Some(value));
                    }
                    ModelNode::Delete { key: k, .. } if k == key => return (slot, head, None),
                    ModelNode::Split { key: k, sidelink, .. } if key > k => {
                        slot = sidelink;
                        continue 'pages;
                    }
                    ModelNode::Insert { origin, .. }
                    | ModelNode::Delete { origin, .. }
                    | ModelNode::Split { origin, .. } => cursor = origin,
                    ModelNode::Base { records, high, next } => {
                        if key > high {
                            slot = next.unwrap();
                            continue 'pages;
                        }
                        let value = records.iter().find(|(k, _)| *k == key).map(|&(_, v)| v);
                        return (slot, head, value);
                    }
                }
            }
        }
    }

    fn get(&self, key: u64) -> Option<u64> {
        self.find(key).2
    }

    fn insert(&self, key: u64, value: u64) {
        loop {
            let (slot, head, _) = self.find(key);
            let delta = self.push(ModelNode::Insert {
                key,
                value,
                origin: head,
            });
            if self.cas(slot, head, delta) {
                return;
            }
            thread::yield_now();
        }
    }

    fn delete(&self, key: u64) -> bool {
        loop {
            let (slot, head, value) = self.find(key);
            if value.is_none() {
                return false;
            }
            let delta = self.push(ModelNode::Delete { key, origin: head });
            if self.cas(slot, head, delta) {
                return true;
            }
            thread::yield_now();
        }
    }

    /// Live records of the chain at `head`, with its split key if any.
    fn collect(&self, head: usize) -> (Vec<(u64, u64)>, Option<(u64, usize)>, u64, Option<usize>) {
        let mut decided = Vec::new();
        let mut records = Vec::new();
        let mut split = None;
        let mut cursor = head;

        loop {
            match self.node(cursor) {
                ModelNode::Insert { key, value, origin } => {
                    if !decided.contains(&key) {
                        decided.push(key);
                        records.push((key, value));
                    }
                    cursor = origin;
                }
                ModelNode::Delete { key, origin } => {
                    decided.push(key);
                    cursor = origin;
                }
                ModelNode::Split { key, sidelink, origin } => {
                    split.get_or_insert((key, sidelink));
                    cursor = origin;
                }
                ModelNode::Base { records: base, high, next } => {
                    records.extend(base.into_iter().filter(|(k, _)| !decided.contains(k)));
                    if let Some((key, _)) = split {
                        records.retain(|(k, _)| *k <= key);
                    }
                    records.sort_unstable();
                    return (records, split, high, next);
                }
            }
        }
    }

    fn consolidate(&self, slot: usize) -> bool {
        let head = self.slots[slot].load(Ordering::Acquire);
        let (records, split, high, next) = self.collect(head);
        let (high, next) = match split {
            Some((key, sidelink)) => (key, Some(sidelink)),
            None => (high, next),
        };
        let base = self.push(ModelNode::Base { records, high, next });
        self.cas(slot, head, base)
    }

    /// Split the left page once. The right slot is reserved up front and
    /// only published by the split delta's CAS.
    fn split_left(&self) -> bool {
        let head = self.slots[0].load(Ordering::Acquire);
        let (records, split, high, next) = self.collect(head);
        if split.is_some() || records.len() < 2 {
            return false;
        }

        let mid = records.len() / 2;
        let key = records[mid - 1].0;
        let right = self.push(ModelNode::Base {
            records: records[mid..].to_vec(),
            high,
            next,
        });
        self.slots[1].store(right, Ordering::Release);

        let delta = self.push(ModelNode::Split {
            key,
            sidelink: 1,
            origin: head,
        });
        self.cas(0, head, delta)
    }

    /// Keys reachable through the page links, in order.
    fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::new();
        let mut slot = Some(0);
        while let Some(current) = slot {
            let (records, split, _, next) = self.collect(self.slots[current].load(Ordering::Acquire));
            keys.extend(records.iter().map(|&(k, _)| k));
            slot = split.map(|(_, sidelink)| sidelink).or(next);
        }
        keys
    }
}

// ============================================================================
//  Shuttle Tests
// ============================================================================

/// Concurrent inserts of distinct keys are never lost, whatever the
/// schedule of their CAS retries.
#[test]
fn test_shuttle_distinct_inserts_survive() {
    shuttle::check_random(
        || {
            let pages = Arc::new(ModelPages::new());

            let workers: Vec<_> = (0..3u64)
                .map(|t| {
                    let pages = Arc::clone(&pages);
                    thread::spawn(move || {
                        for i in 0..3 {
                            let key = t * 10 + i;
                            pages.insert(key, key + 100);
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }

            for t in 0..3 {
                for i in 0..3 {
                    let key = t * 10 + i;
                    assert_eq!(pages.get(key), Some(key + 100));
                }
            }
        },
        200,
    );
}

/// A consolidation racing with writers either installs a base page that
/// contains everything the head it started from contained, or loses its
/// CAS. No write disappears either way.
#[test]
fn test_shuttle_consolidation_races_writers() {
    shuttle::check_random(
        || {
            let pages = Arc::new(ModelPages::new());
            pages.insert(1, 1);
            pages.insert(2, 2);

            let writer = {
                let pages = Arc::clone(&pages);
                thread::spawn(move || {
                    pages.insert(3, 3);
                    pages.delete(1);
                    pages.insert(2, 20);
                })
            };
            let consolidator = {
                let pages = Arc::clone(&pages);
                thread::spawn(move || {
                    pages.consolidate(0);
                    pages.consolidate(0);
                })
            };
            writer.join().unwrap();
            consolidator.join().unwrap();

            assert_eq!(pages.get(1), None);
            assert_eq!(pages.get(2), Some(20));
            assert_eq!(pages.get(3), Some(3));
            assert_eq!(pages.keys(), vec![2, 3]);
        },
        200,
    );
}

/// Writers racing a split end up on the correct side: anything inserted
/// before the split CAS is copied or lost the CAS race and retried against
/// the new chain, anything after routes through the sidelink.
#[test]
fn test_shuttle_split_races_writers() {
    shuttle::check_random(
        || {
            let pages = Arc::new(ModelPages::new());
            for key in [10, 20, 30, 40] {
                pages.insert(key, key);
            }

            let splitter = {
                let pages = Arc::clone(&pages);
                thread::spawn(move || pages.split_left())
            };
            let writer = {
                let pages = Arc::clone(&pages);
                thread::spawn(move || {
                    pages.insert(35, 35);
                    pages.insert(5, 5);
                })
            };
            let split = splitter.join().unwrap();
            writer.join().unwrap();

            for key in [5, 10, 20, 30, 35, 40] {
                assert_eq!(pages.get(key), Some(key), "key {key}, split {split}");
            }
            assert_eq!(pages.keys(), vec![5, 10, 20, 30, 35, 40]);
        },
        300,
    );
}

/// Same-key upserts serialize: the survivor is one of the written values
/// and every losing CAS was counted.
#[test]
fn test_shuttle_same_key_upserts_serialize() {
    shuttle::check_random(
        || {
            let pages = Arc::new(ModelPages::new());

            let writers: Vec<_> = [100u64, 200]
                .into_iter()
                .map(|value| {
                    let pages = Arc::clone(&pages);
                    thread::spawn(move || pages.insert(42, value))
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }

            let value = pages.get(42).unwrap();
            assert!(value == 100 || value == 200, "unexpected value {value}");
            assert!(pages.collisions.load(Ordering::Relaxed) <= 1);
        },
        200,
    );
}
