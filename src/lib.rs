//! Fast incremental model trees (FIMT) for regression on data streams
//! ----------------------------------------------------------------------------
//! A single-pass, bounded-memory learner of piecewise-linear (or
//! piecewise-constant) predictors. It implements:
//!   * Hoeffding-bound split decisions over streaming split-candidate histograms
//!   * An online perceptron per leaf, trained on tree-normalized inputs
//!   * Two mergeable histogram realizations (bounded bins, quantile sketch)
//!     behind one trait, also used for quantile leaves
//!   * A memory governor that reversibly freezes leaves to respect a byte budget
//!   * Optional Page-Hinckley change detection with alternate subtrees
//!
//! # Design notes
//! Nodes live in an arena and link to their parent by index. A split rewrites
//! the leaf in place after both children exist, and an alternate subtree is
//! promoted by rewriting a single child slot.
//!
//! Predictions never fail: degenerate statistics fall back to the running
//! target mean. Only configuration and contract violations on `train` (NaN
//! target, bad weight, changing dimension) are reported as errors.
//!
//! # Example
//! ```
//! use fimt_trees::{FimtTree, TreeConfig};
//! use rand::rngs::StdRng;
//! use rand::{Rng, SeedableRng};
//!
//! let config = TreeConfig::default()
//!     .with_grace_period(50)
//!     .with_split_confidence(0.01);
//! let mut tree = FimtTree::new(config)?;
//! let mut rng = StdRng::seed_from_u64(42);
//!
//! // Test-then-train on a piecewise-linear stream
//! let mut abs_error = 0.0;
//! for _ in 0..5000 {
//!     let x = [rng.random_range(0.0..1.0), rng.random_range(-1.0..1.0)];
//!     let y = if x[0] < 0.5 { 2.0 * x[0] } else { 4.0 - x[0] } + rng.random_range(-0.05..0.05);
//!     abs_error += (tree.predict(&x) - y).abs();
//!     tree.train(&x, y, 1.0)?;
//! }
//! println!("mean absolute error = {:.4}", abs_error / 5000.0);
//! println!("{tree}");
//! # Ok::<(), fimt_trees::FimtError>(())
//! ```

pub mod config;
pub mod criterion;
pub mod drift;
pub mod error;
pub mod histogram;
mod memory;
pub mod node;
pub mod observer;
pub mod perceptron;
pub mod stats;
pub mod tree;

pub use config::{DriftConfig, FeatureSubspace, TreeConfig};
pub use criterion::{
    SplitCriterion, SplitSuggestion, SplitTest, TargetStats, VarianceReduction,
    compute_hoeffding_bound,
};
pub use error::{FimtError, Result};
pub use histogram::{
    Histogram, HistogramKind, MergeableHistogram, QuantileSketch, StreamingHistogram,
};
pub use node::{NodeId, NodeKind, NodeStats};
pub use observer::AttributeSplitObserver;
pub use perceptron::Perceptron;
pub use stats::{GlobalStats, Moments};
pub use tree::{FimtTree, LeafSummary, TreeMeasurements};

pub type FeatureVector = [f64];
