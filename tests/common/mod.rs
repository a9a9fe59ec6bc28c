//! Shared helpers for the integration tests: tracing setup and tree
//! construction.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     let tree = common::eager_tree();
//!     // ...
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Filter directives (e.g., `bwtree=debug,bwtree::tree::split=trace`)
//! - `BWTREE_LOG_DIR`: Log directory (default: `logs/`)
//! - `BWTREE_LOG_CONSOLE`: Set to "0" to disable console output
//!
//! The crate only emits events when built with `--features tracing`.
//!
//! # Log Files
//!
//! Logs are appended to `logs/bwtree.jsonl` as newline-delimited JSON:
//!
//! ```bash
//! # Every split and root growth
//! jq 'select(.fields.message | test("split|root"))' logs/bwtree.jsonl
//!
//! # Events for one page
//! jq 'select(.fields.pid == "pid:3")' logs/bwtree.jsonl
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Once;

use bwtree::{BwTree, EpochConfig, Settings};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with file and console logging.
///
/// Safe to call multiple times - only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        setup_tracing();
    });
}

/// Configuration for tracing setup.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// Log file name.
    pub log_file: String,
    /// Enable console output.
    pub console_enabled: bool,
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file: "bwtree.jsonl".to_string(),
            console_enabled: true,
            default_level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("BWTREE_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if env::var("BWTREE_LOG_CONSOLE").is_ok_and(|v| v == "0") {
            config.console_enabled = false;
        }

        config
    }
}

fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let config = TracingConfig::from_env();

    std::fs::create_dir_all(&config.log_dir).expect("Failed to create log directory");
    let log_path = config.log_dir.join(&config.log_file);

    // Append: nextest runs every test in its own process.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .expect("Failed to open log file");

    let console_layer = config.console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .compact()
            .with_filter(make_filter(config.default_level))
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(make_filter(config.default_level));

    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

// ============================================================================
//  Tree construction
// ============================================================================

/// Settings that split and consolidate after a handful of operations, so
/// small tests exercise every structure modification.
pub fn eager_settings() -> Settings {
    Settings::default()
        .with_split_leaf(4)
        .with_split_inner([4, 6])
        .with_consolidate_leaf(3)
        .with_consolidate_inner([2, 3])
        .with_epoch(EpochConfig {
            advance_interval: 4,
            collect_threshold: 8,
        })
}

/// A `u64 -> u64` tree built from [`eager_settings`].
#[expect(clippy::unwrap_used)]
pub fn eager_tree() -> BwTree<u64, u64> {
    BwTree::with_settings(eager_settings()).unwrap()
}

/// Deterministic xorshift sequence for reproducible key streams.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}
