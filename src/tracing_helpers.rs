//! Logging macros that cost nothing unless the `tracing` feature is on.
//!
//! With the feature enabled each macro forwards to the matching `tracing`
//! macro. Without it the invocation expands to nothing, so hot paths such as
//! the delta-prepend retry loop carry no logging code at all.
//!
//! ```bash
//! # No logging compiled in
//! cargo build --release
//!
//! # Watch split propagation in one test
//! RUST_LOG=bwtree::tree::split=trace cargo test --features tracing concurrent_split
//! ```
//!
//! Spans are added with `cfg_attr` so they vanish together with the macros:
//!
//! ```ignore
//! #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(pid = %pid)))]
//! fn split_page(&self, pid: Pid, parent: Option<Pid>, guard: &NodeGuard<'_, '_, K, V>) -> bool {
//!     // entry and exit of the span are logged
//! }
//! ```

#![allow(unused_macros, unused_imports)]

/// Trace-level event: per-CAS outcomes and retry noise.
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level event: completed splits, consolidations and root growth.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

/// Warn-level event: abandoned structure modifications.
#[cfg(feature = "tracing")]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_log {
    ($($arg:tt)*) => {};
}

/// Error-level event: emitted right before a fatal abort.
#[cfg(feature = "tracing")]
macro_rules! error_log {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use error_log;
pub(crate) use trace_log;
pub(crate) use warn_log;
