//! Error type shared by the whole crate.

use thiserror::Error;

/// Errors reported by tree construction and training.
///
/// Most anomalies in a stream (NaN features, degenerate statistics, an
/// unreachable memory budget) are resolved locally and never surface here.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FimtError {
    /// A configuration value is outside its valid range.
    #[error("invalid configuration `{name}`: {reason}")]
    InvalidConfig { name: &'static str, reason: String },

    /// A training target was NaN or infinite.
    #[error("training target is not finite: {0}")]
    NonFiniteTarget(f64),

    /// An instance weight was negative or not finite.
    #[error("invalid instance weight: {0}")]
    InvalidWeight(f64),

    /// An instance does not have the number of features the tree was trained with.
    #[error("dimension mismatch: expected {expected} features, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FimtError>;
