//! Tree configuration.
//!
//! One [`Settings`] value is owned by each tree. Thresholds are per level:
//! leaves have their own pair, inner pages are configured by level (index 0
//! is the level directly above the leaves) and the last entry applies to
//! every level above it.

use std::fmt as StdFmt;

use crate::epoch::EpochConfig;

// ============================================================================
//  SettingsError
// ============================================================================

/// Reasons a [`Settings`] value is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsError {
    /// A split threshold below 2 would split pages that cannot be halved.
    SplitThreshold {
        /// Page level the threshold applies to (0 = leaves).
        level: usize,
        /// Rejected value.
        value: usize,
    },

    /// A consolidation threshold of 0 would consolidate base pages.
    ConsolidateThreshold {
        /// Page level the threshold applies to (0 = leaves).
        level: usize,
        /// Rejected value.
        value: usize,
    },

    /// A per-level inner threshold table has no entries.
    EmptyLevelTable(&'static str),

    /// An admission probability outside `(0, 1]`.
    Admission {
        /// Which probability.
        name: &'static str,
        /// Rejected value.
        value: f64,
    },

    /// The mapping table cannot hold even the initial root.
    MappingCapacity(usize),

    /// The epoch must advance at some point.
    EpochAdvanceInterval,
}

impl StdFmt::Display for SettingsError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::SplitThreshold { level, value } => {
                write!(f, "split threshold {value} at level {level} must be at least 2")
            }

            Self::ConsolidateThreshold { level, value } => {
                write!(f, "consolidation threshold {value} at level {level} must be at least 1")
            }

            Self::EmptyLevelTable(name) => write!(f, "{name} needs at least one level"),

            Self::Admission { name, value } => {
                write!(f, "{name} admission probability {value} is outside (0, 1]")
            }

            Self::MappingCapacity(capacity) => {
                write!(f, "mapping table capacity {capacity} is too small")
            }

            Self::EpochAdvanceInterval => write!(f, "epoch advance interval must be positive"),
        }
    }
}

impl std::error::Error for SettingsError {}

// ============================================================================
//  Settings
// ============================================================================

/// Thresholds and knobs of one tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Split a leaf once it holds more than this many records.
    pub split_leaf: usize,

    /// Split an inner page once it routes to more than this many children,
    /// indexed by level minus one.
    pub split_inner: Vec<usize>,

    /// Consolidate a leaf once its chain holds this many deltas.
    pub consolidate_leaf: usize,

    /// Consolidate an inner page once its chain holds this many deltas,
    /// indexed by level minus one.
    pub consolidate_inner: Vec<usize>,

    /// Base probability of acting on an oversized page. Divided by
    /// `level + 1`.
    pub split_admission: f64,

    /// Base probability of acting on an overlong chain. Divided by
    /// `level + 1`.
    pub consolidate_admission: f64,

    /// Number of page ids the tree can ever hand out.
    pub mapping_capacity: usize,

    /// Epoch reclamation knobs.
    pub epoch: EpochConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            split_leaf: 128,
            split_inner: vec![128],
            consolidate_leaf: 8,
            consolidate_inner: vec![4],
            split_admission: 1.0,
            consolidate_admission: 1.0,
            mapping_capacity: 1 << 20,
            epoch: EpochConfig::default(),
        }
    }
}

impl Settings {
    /// Leaf split threshold.
    #[must_use]
    pub const fn with_split_leaf(mut self, threshold: usize) -> Self {
        self.split_leaf = threshold;
        self
    }

    /// Inner split thresholds, starting at level 1.
    #[must_use]
    pub fn with_split_inner(mut self, thresholds: impl Into<Vec<usize>>) -> Self {
        self.split_inner = thresholds.into();
        self
    }

    /// Leaf consolidation threshold.
    #[must_use]
    pub const fn with_consolidate_leaf(mut self, threshold: usize) -> Self {
        self.consolidate_leaf = threshold;
        self
    }

    /// Inner consolidation thresholds, starting at level 1.
    #[must_use]
    pub fn with_consolidate_inner(mut self, thresholds: impl Into<Vec<usize>>) -> Self {
        self.consolidate_inner = thresholds.into();
        self
    }

    /// Split and consolidation admission probabilities.
    #[must_use]
    pub const fn with_admission(mut self, split: f64, consolidate: f64) -> Self {
        self.split_admission = split;
        self.consolidate_admission = consolidate;
        self
    }

    /// Mapping table capacity.
    #[must_use]
    pub const fn with_mapping_capacity(mut self, capacity: usize) -> Self {
        self.mapping_capacity = capacity;
        self
    }

    /// Epoch reclamation knobs.
    #[must_use]
    pub const fn with_epoch(mut self, epoch: EpochConfig) -> Self {
        self.epoch = epoch;
        self
    }

    /// Split threshold of pages at `level`.
    #[must_use]
    pub fn split_threshold(&self, level: u16) -> usize {
        Self::per_level(self.split_leaf, &self.split_inner, level)
    }

    /// Consolidation threshold of pages at `level`.
    #[must_use]
    pub fn consolidate_threshold(&self, level: u16) -> usize {
        Self::per_level(self.consolidate_leaf, &self.consolidate_inner, level)
    }

    fn per_level(leaf: usize, inner: &[usize], level: u16) -> usize {
        if level == 0 {
            return leaf;
        }

        let index = usize::from(level - 1);
        inner
            .get(index)
            .or_else(|| inner.last())
            .copied()
            .unwrap_or(leaf)
    }

    /// Check every knob.
    ///
    /// # Errors
    ///
    /// The first [`SettingsError`] found.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.split_inner.is_empty() {
            return Err(SettingsError::EmptyLevelTable("split_inner"));
        }
        if self.consolidate_inner.is_empty() {
            return Err(SettingsError::EmptyLevelTable("consolidate_inner"));
        }

        let splits = std::iter::once(self.split_leaf).chain(self.split_inner.iter().copied());
        for (level, value) in splits.enumerate() {
            if value < 2 {
                return Err(SettingsError::SplitThreshold { level, value });
            }
        }

        let consolidations =
            std::iter::once(self.consolidate_leaf).chain(self.consolidate_inner.iter().copied());
        for (level, value) in consolidations.enumerate() {
            if value == 0 {
                return Err(SettingsError::ConsolidateThreshold { level, value });
            }
        }

        for (name, value) in [
            ("split", self.split_admission),
            ("consolidate", self.consolidate_admission),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(SettingsError::Admission { name, value });
            }
        }

        if self.mapping_capacity == 0 {
            return Err(SettingsError::MappingCapacity(self.mapping_capacity));
        }

        if self.epoch.advance_interval == 0 {
            return Err(SettingsError::EpochAdvanceInterval);
        }

        Ok(())
    }
}

// ============================================================================
//  Tests
// ============================================================================
