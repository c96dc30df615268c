//! Mergeable approximations of a stream of real values.
//!
//! Two realizations sit behind [`MergeableHistogram`]:
//!   * [`StreamingHistogram`], a bounded-bin frequency histogram in the style of
//!     Ben-Haim & Tom-Tov's streaming parallel decision trees;
//!   * [`QuantileSketch`], a rank-based sketch over a `tdigests` t-digest.
//!
//! [`Histogram`] selects one of them at construction time from a
//! [`HistogramKind`], so callers never name the concrete type.
//!
//! Counts are exact in both realizations, including across merges; only the
//! positions of mass are approximate.

mod bins;
mod sketch;

pub use self::bins::{Bin, StreamingHistogram};
pub use self::sketch::QuantileSketch;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An approximate, mergeable summary of inserted scalar values.
pub trait MergeableHistogram {
    /// Insert one value. NaN and infinite values are ignored.
    fn insert(&mut self, value: f64) {
        self.insert_weighted(value, 1);
    }

    /// Insert `count` copies of `value`.
    fn insert_weighted(&mut self, value: f64, count: u64);

    /// Absorb `other` into `self`. The result carries the error of both operands.
    fn merge(&mut self, other: &Self);

    /// Consuming form of [`merge`](Self::merge).
    fn merged(mut self, other: &Self) -> Self
    where
        Self: Sized,
    {
        self.merge(other);
        self
    }

    /// `k` non-decreasing points splitting the observed mass into `k + 1`
    /// roughly equal-mass intervals. Empty when nothing has been inserted.
    fn uniform(&self, k: usize) -> Vec<f64>;

    /// Number of values inserted (exact).
    fn total_count(&self) -> u64;

    /// Approximate number of inserted values `<= p`, non-decreasing in `p`.
    fn sum_at_or_below(&self, p: f64) -> f64;

    /// The summary as weighted points, in ascending order of value.
    fn weighted_points(&self) -> Vec<(f64, u64)>;

    /// Estimated heap and inline size in bytes.
    fn byte_size(&self) -> usize;
}

/// Histogram realization chosen by a tree's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HistogramKind {
    /// Bounded-bin frequency histogram.
    #[default]
    Bins,
    /// Rank-based quantile sketch.
    Sketch,
}

impl HistogramKind {
    /// Build an empty histogram of this kind holding about `capacity` bins or centroids.
    pub fn build(self, capacity: usize) -> Histogram {
        match self {
            HistogramKind::Bins => Histogram::Bins(StreamingHistogram::new(capacity)),
            HistogramKind::Sketch => Histogram::Sketch(QuantileSketch::new(capacity)),
        }
    }
}

/// A histogram of either realization.
#[derive(Debug, Clone, PartialEq)]
pub enum Histogram {
    Bins(StreamingHistogram),
    Sketch(QuantileSketch),
}

impl Histogram {
    pub fn kind(&self) -> HistogramKind {
        match self {
            Histogram::Bins(_) => HistogramKind::Bins,
            Histogram::Sketch(_) => HistogramKind::Sketch,
        }
    }

    /// Smallest value inserted so far.
    pub fn min(&self) -> Option<f64> {
        match self {
            Histogram::Bins(h) => h.min(),
            Histogram::Sketch(h) => h.min(),
        }
    }

    /// Largest value inserted so far.
    pub fn max(&self) -> Option<f64> {
        match self {
            Histogram::Bins(h) => h.max(),
            Histogram::Sketch(h) => h.max(),
        }
    }

    /// Approximate `q`-quantile (`q` in `[0, 1]`) of the inserted values.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if q.is_nan() {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        if q <= 0.0 {
            return self.min();
        }
        if q >= 1.0 {
            return self.max();
        }
        let rank = q * self.total_count() as f64;
        match self {
            Histogram::Bins(h) => h.point_at_rank(rank),
            Histogram::Sketch(h) => h.point_at_rank(rank),
        }
    }
}

impl MergeableHistogram for Histogram {
    fn insert_weighted(&mut self, value: f64, count: u64) {
        match self {
            Histogram::Bins(h) => h.insert_weighted(value, count),
            Histogram::Sketch(h) => h.insert_weighted(value, count),
        }
    }

    fn merge(&mut self, other: &Self) {
        match (&mut *self, other) {
            (Histogram::Bins(a), Histogram::Bins(b)) => a.merge(b),
            (Histogram::Sketch(a), Histogram::Sketch(b)) => a.merge(b),
            // Different realizations: replay the other summary's weighted points.
            (this, other) => {
                for (value, count) in other.weighted_points() {
                    this.insert_weighted(value, count);
                }
            }
        }
    }

    fn uniform(&self, k: usize) -> Vec<f64> {
        match self {
            Histogram::Bins(h) => h.uniform(k),
            Histogram::Sketch(h) => h.uniform(k),
        }
    }

    fn total_count(&self) -> u64 {
        match self {
            Histogram::Bins(h) => h.total_count(),
            Histogram::Sketch(h) => h.total_count(),
        }
    }

    fn sum_at_or_below(&self, p: f64) -> f64 {
        match self {
            Histogram::Bins(h) => h.sum_at_or_below(p),
            Histogram::Sketch(h) => h.sum_at_or_below(p),
        }
    }

    fn weighted_points(&self) -> Vec<(f64, u64)> {
        match self {
            Histogram::Bins(h) => h.weighted_points(),
            Histogram::Sketch(h) => h.weighted_points(),
        }
    }

    fn byte_size(&self) -> usize {
        match self {
            Histogram::Bins(h) => h.byte_size(),
            Histogram::Sketch(h) => h.byte_size(),
        }
    }
}
