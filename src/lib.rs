//! # `BwTree`
//!
//! A lock-free, in-memory ordered index in the Bw-Tree style.
//!
//! Pages are logical: a [`mapping::MappingTable`] maps each stable page id
//! ([`Pid`]) to the head of an immutable chain of delta records ending in a
//! base page. Every mutation is one compare-and-swap on a mapping slot (or on
//! the root PID), so no operation ever takes a lock on the tree.
//!
//! | Operation | How |
//! |-----------|-----|
//! | `search` | walk root to leaf, newest delta first |
//! | `insert` / `delete_key` | prepend a delta with one CAS, retry from the root on failure |
//! | consolidation | rebuild a chain into a fresh base page, one CAS |
//! | split | split delta + right sibling, then an index delta on the parent or a new root |
//! | reclamation | unlinked chains released by an epoch-based reclaimer |
//!
//! ## Thread Safety
//!
//! `BwTree<K, V>` is `Send + Sync` when `K` and `V` are. Every operation
//! takes the calling thread's [`TreeHandle`]:
//!
//! ```rust
//! use bwtree::{BwTree, Settings};
//!
//! let settings = Settings::default().with_split_leaf(4);
//! let tree: BwTree<u64, &str> = BwTree::with_settings(settings).unwrap();
//!
//! std::thread::scope(|scope| {
//!     for t in 0..4u64 {
//!         let tree = &tree;
//!         scope.spawn(move || {
//!             let mut handle = tree.handle();
//!             for i in 0..100 {
//!                 tree.insert(t * 1_000 + i, "value", &mut handle);
//!             }
//!         });
//!     }
//! });
//!
//! let mut handle = tree.handle();
//! assert_eq!(tree.search(&3_042, &mut handle), Some("value"));
//! assert_eq!(tree.leaf_keys(&mut handle).len(), 400);
//! ```
//!
//! ## Key Constraints
//!
//! - Keys are fixed-size values: `K: Ord + Copy`.
//! - Values are cloned out on `search`: `V: Clone`.
//!
//! ## Logging
//!
//! Enable the `tracing` feature to route split, consolidation and retry
//! events to the [`tracing`](https://docs.rs/tracing) ecosystem. Without it
//! the log statements compile to nothing.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// Hot traversal helpers are forced inline; see benches/tree.rs.
#![allow(clippy::inline_always)]

mod node;
mod tracing_helpers;

pub mod epoch;
pub mod mapping;
pub mod ordering;
pub mod settings;
pub mod stats;
pub mod tree;

// Re-export main types for convenience
pub use epoch::EpochConfig;
pub use mapping::Pid;
pub use settings::{Settings, SettingsError};
pub use stats::StatsSnapshot;
pub use tree::{BwTree, TreeHandle};
