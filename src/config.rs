//! Tree configuration.
//!
//! All options live in one [`TreeConfig`] that is validated once and then
//! shared read-only by every component of a tree.

use crate::error::{FimtError, Result};
use crate::histogram::HistogramKind;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which features an active leaf observes when collecting split candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FeatureSubspace {
    /// Every feature.
    #[default]
    All,
    /// A random subset of exactly `k` features per leaf.
    Fixed(usize),
    /// A random subset of all features but `k`.
    AllBut(usize),
}

impl FeatureSubspace {
    /// Number of features a leaf observes out of `n_features`, clamped to `[1, n_features]`.
    pub fn size(self, n_features: usize) -> usize {
        let k = match self {
            FeatureSubspace::All => n_features,
            FeatureSubspace::Fixed(k) => k,
            FeatureSubspace::AllBut(k) => n_features.saturating_sub(k),
        };
        k.clamp(1.min(n_features), n_features)
    }
}

/// Page-Hinckley change detection and alternate subtree settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DriftConfig {
    /// Grow and evaluate alternate subtrees when a split node detects drift.
    pub enabled: bool,
    /// Magnitude of changes tolerated by the Page-Hinckley test.
    pub ph_alpha: f64,
    /// Page-Hinckley alarm threshold.
    pub ph_threshold: f64,
    /// Fading factor for the loss comparison between original and alternate.
    pub fading_factor: f64,
    /// Examples between two promotion tests of an alternate subtree.
    pub t_min: u32,
    /// Examples after which a non-promoted alternate subtree is discarded.
    pub alternate_time: u32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ph_alpha: 0.005,
            ph_threshold: 50.0,
            fading_factor: 0.995,
            t_min: 150,
            alternate_time: 1500,
        }
    }
}

/// Configuration of a [`FimtTree`](crate::FimtTree).
///
/// # Example
///
/// ```
/// use fimt_trees::TreeConfig;
///
/// let config = TreeConfig::default()
///     .with_grace_period(50)
///     .with_split_confidence(0.01)
///     .with_max_bytes(1 << 20);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreeConfig {
    /// Examples a leaf observes between split attempts.
    pub grace_period: u32,
    /// Allowed error of a split decision, in (0, 1).
    pub split_confidence: f64,
    /// Hoeffding bound below which a split is forced to break ties, in [0, 1].
    pub tie_threshold: f64,
    /// Base learning rate of the leaf perceptrons.
    pub learning_rate: f64,
    /// Learning rate decay factor (ignored with a constant learning rate).
    pub learning_rate_decay: f64,
    pub use_constant_learning_rate: bool,
    /// Fit a linear model per leaf; otherwise leaves predict their target mean.
    pub build_linear_leaf_model: bool,
    /// Score a "no split" candidate alongside the feature candidates.
    pub pre_prune: bool,
    /// Track memory and deactivate leaves to respect `max_bytes`.
    pub memory_management: bool,
    /// Memory budget of the tree in bytes.
    pub max_bytes: u64,
    /// Training instances between two memory estimates.
    pub memory_estimate_period: u32,
    /// Freeze all growth once over budget instead of ranking leaves by promise.
    pub stop_growth_on_budget: bool,
    /// Candidate thresholds evaluated per feature.
    pub num_split_candidates: u32,
    /// Bin (or sketch) capacity of each split-candidate histogram.
    pub observer_bins: usize,
    /// Target buckets of a regression observer.
    pub target_buckets: usize,
    /// Histogram realization used by observers and quantile leaves.
    pub histogram_kind: HistogramKind,
    /// When set, every leaf keeps a target histogram of this capacity.
    pub quantile_leaf_bins: Option<usize>,
    pub feature_subspace: FeatureSubspace,
    pub drift: DriftConfig,
    /// Seed of the tree's random number generator.
    pub seed: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            grace_period: 200,
            split_confidence: 1e-7,
            tie_threshold: 0.05,
            learning_rate: 0.02,
            learning_rate_decay: 0.001,
            use_constant_learning_rate: false,
            build_linear_leaf_model: true,
            pre_prune: true,
            memory_management: true,
            max_bytes: i32::MAX as u64,
            memory_estimate_period: 1_000_000,
            stop_growth_on_budget: false,
            num_split_candidates: 10,
            observer_bins: 64,
            target_buckets: 10,
            histogram_kind: HistogramKind::Bins,
            quantile_leaf_bins: None,
            feature_subspace: FeatureSubspace::All,
            drift: DriftConfig::default(),
            seed: 1,
        }
    }
}

impl TreeConfig {
    pub fn with_grace_period(mut self, grace_period: u32) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_split_confidence(mut self, split_confidence: f64) -> Self {
        self.split_confidence = split_confidence;
        self
    }

    pub fn with_tie_threshold(mut self, tie_threshold: f64) -> Self {
        self.tie_threshold = tie_threshold;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_learning_rate_decay(mut self, decay: f64) -> Self {
        self.learning_rate_decay = decay;
        self
    }

    pub fn with_constant_learning_rate(mut self, constant: bool) -> Self {
        self.use_constant_learning_rate = constant;
        self
    }

    /// Build a regression tree (mean leaves) instead of a model tree.
    pub fn regression_tree(mut self) -> Self {
        self.build_linear_leaf_model = false;
        self
    }

    pub fn with_pre_prune(mut self, pre_prune: bool) -> Self {
        self.pre_prune = pre_prune;
        self
    }

    pub fn with_memory_management(mut self, enabled: bool) -> Self {
        self.memory_management = enabled;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_memory_estimate_period(mut self, period: u32) -> Self {
        self.memory_estimate_period = period;
        self
    }

    pub fn with_stop_growth_on_budget(mut self, stop: bool) -> Self {
        self.stop_growth_on_budget = stop;
        self
    }

    pub fn with_num_split_candidates(mut self, n: u32) -> Self {
        self.num_split_candidates = n;
        self
    }

    pub fn with_observer_bins(mut self, bins: usize) -> Self {
        self.observer_bins = bins;
        self
    }

    pub fn with_histogram_kind(mut self, kind: HistogramKind) -> Self {
        self.histogram_kind = kind;
        self
    }

    /// Enable the quantile-leaf variant with target histograms of `bins` capacity.
    pub fn with_quantile_leaves(mut self, bins: usize) -> Self {
        self.quantile_leaf_bins = Some(bins);
        self
    }

    pub fn with_feature_subspace(mut self, subspace: FeatureSubspace) -> Self {
        self.feature_subspace = subspace;
        self
    }

    pub fn with_drift(mut self, drift: DriftConfig) -> Self {
        self.drift = drift;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check every option against its valid range.
    pub fn validate(&self) -> Result<()> {
        if !(self.split_confidence > 0.0 && self.split_confidence < 1.0) {
            return Err(invalid(
                "split_confidence",
                format!("{} is not in (0, 1)", self.split_confidence),
            ));
        }
        if !(0.0..=1.0).contains(&self.tie_threshold) {
            return Err(invalid(
                "tie_threshold",
                format!("{} is not in [0, 1]", self.tie_threshold),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate >= 0.0) {
            return Err(invalid(
                "learning_rate",
                format!("{} must be finite and non-negative", self.learning_rate),
            ));
        }
        if !(self.learning_rate_decay.is_finite() && self.learning_rate_decay >= 0.0) {
            return Err(invalid(
                "learning_rate_decay",
                format!("{} must be finite and non-negative", self.learning_rate_decay),
            ));
        }
        if self.num_split_candidates == 0 {
            return Err(invalid("num_split_candidates", "must be at least 1".into()));
        }
        if self.observer_bins < 2 {
            return Err(invalid("observer_bins", "must be at least 2".into()));
        }
        if self.target_buckets == 0 {
            return Err(invalid("target_buckets", "must be at least 1".into()));
        }
        if self.quantile_leaf_bins.is_some_and(|bins| bins < 2) {
            return Err(invalid("quantile_leaf_bins", "must be at least 2".into()));
        }
        if self.memory_management && self.memory_estimate_period == 0 {
            return Err(invalid(
                "memory_estimate_period",
                "must be at least 1 when memory management is enabled".into(),
            ));
        }
        if let FeatureSubspace::Fixed(0) = self.feature_subspace {
            return Err(invalid("feature_subspace", "subspace must not be empty".into()));
        }
        let drift = &self.drift;
        if !(drift.fading_factor > 0.0 && drift.fading_factor <= 1.0) {
            return Err(invalid(
                "drift.fading_factor",
                format!("{} is not in (0, 1]", drift.fading_factor),
            ));
        }
        if !(drift.ph_alpha >= 0.0 && drift.ph_threshold >= 0.0) {
            return Err(invalid(
                "drift.ph_threshold",
                "Page-Hinckley parameters must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: String) -> FimtError {
    FimtError::InvalidConfig { name, reason }
}
