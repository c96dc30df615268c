//! Per-feature split-candidate observers.
//!
//! An observer keeps one histogram of the feature's values per target bucket.
//! Buckets partition the tree-normalized target range `[-1, 1]` into equal
//! slices and carry the exact target moments of the examples they received,
//! so the target distribution on each side of a threshold is the sum of every
//! bucket's moments weighted by the share of its histogram below the threshold.

use std::mem::size_of;

use crate::criterion::{SplitCriterion, SplitSuggestion, SplitTest, TargetStats};
use crate::histogram::{Histogram, HistogramKind, MergeableHistogram};

#[derive(Debug, Clone)]
struct TargetBucket {
    values: Histogram,
    target: TargetStats,
}

/// Collects the values of one feature at one leaf and turns them into split suggestions.
#[derive(Debug, Clone)]
pub struct AttributeSplitObserver {
    kind: HistogramKind,
    bins: usize,
    buckets: Vec<Option<TargetBucket>>,
}

impl AttributeSplitObserver {
    pub fn new(kind: HistogramKind, bins: usize, target_buckets: usize) -> Self {
        Self {
            kind,
            bins,
            buckets: vec![None; target_buckets.max(1)],
        }
    }

    fn bucket_index(&self, normalized_target: f64) -> usize {
        let n = self.buckets.len();
        let position = (normalized_target.clamp(-1.0, 1.0) + 1.0) / 2.0 * n as f64;
        (position as usize).min(n - 1)
    }

    /// Record `value` for an example with target `y` (and its tree-normalized
    /// form) seen with `weight`. NaN and infinite values are never observed.
    pub fn observe(&mut self, value: f64, y: f64, normalized_target: f64, weight: f64) {
        let count = weight.round();
        if !value.is_finite() || count < 1.0 {
            return;
        }
        let index = self.bucket_index(normalized_target);
        let (kind, bins) = (self.kind, self.bins);
        let bucket = self.buckets[index].get_or_insert_with(|| TargetBucket {
            values: kind.build(bins),
            target: TargetStats::default(),
        });
        bucket.values.insert_weighted(value, count as u64);
        bucket.target.add(y, count);
    }

    /// Number of values observed.
    pub fn total_count(&self) -> u64 {
        self.buckets
            .iter()
            .flatten()
            .map(|bucket| bucket.values.total_count())
            .sum()
    }

    /// The feature's overall distribution at this leaf.
    pub fn merged_histogram(&self) -> Option<Histogram> {
        let mut buckets = self.buckets.iter().flatten();
        let mut merged = buckets.next()?.values.clone();
        for bucket in buckets {
            merged.merge(&bucket.values);
        }
        Some(merged)
    }

    /// Target distributions left (`<= threshold`) and right of `threshold`.
    pub fn split_distributions(&self, threshold: f64) -> [TargetStats; 2] {
        let mut sides = [TargetStats::default(); 2];
        for bucket in self.buckets.iter().flatten() {
            let total = bucket.values.total_count() as f64;
            if total <= 0.0 {
                continue;
            }
            let below = (bucket.values.sum_at_or_below(threshold) / total).clamp(0.0, 1.0);
            for (side, share) in sides.iter_mut().zip([below, 1.0 - below]) {
                side.weight += share * bucket.target.weight;
                side.sum += share * bucket.target.sum;
                side.sum_sq += share * bucket.target.sum_sq;
            }
        }
        sides
    }

    /// Best threshold for `feature` among `num_candidates` near-uniform
    /// candidates, or `None` before any value was observed. The first of
    /// equally good candidates wins.
    pub fn best_split_suggestion(
        &self,
        criterion: &dyn SplitCriterion,
        pre_split: &TargetStats,
        feature: usize,
        num_candidates: usize,
    ) -> Option<SplitSuggestion> {
        let merged = self.merged_histogram()?;
        if merged.total_count() == 0 {
            return None;
        }
        let mut best: Option<SplitSuggestion> = None;
        let mut previous = None;
        for threshold in merged.uniform(num_candidates) {
            if previous == Some(threshold) {
                continue;
            }
            previous = Some(threshold);
            let resulting = self.split_distributions(threshold);
            let merit = criterion.merit_of_split(pre_split, &resulting);
            if best.as_ref().is_none_or(|b| merit > b.merit) {
                best = Some(SplitSuggestion {
                    test: Some(SplitTest { feature, threshold }),
                    merit,
                    resulting,
                });
            }
        }
        best
    }

    pub fn byte_size(&self) -> usize {
        size_of::<Self>()
            + self.buckets.capacity() * size_of::<Option<TargetBucket>>()
            + self
                .buckets
                .iter()
                .flatten()
                .map(|bucket| bucket.values.byte_size().saturating_sub(size_of::<Histogram>()))
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion::VarianceReduction;
    use approx::assert_abs_diff_eq;

    fn pre_split(observations: &[(f64, f64)]) -> TargetStats {
        let mut pre = TargetStats::default();
        for &(_, y) in observations {
            pre.add(y, 1.0);
        }
        pre
    }

    #[test]
    fn empty_observer_suggests_nothing() {
        let observer = AttributeSplitObserver::new(HistogramKind::Bins, 16, 10);
        let suggestion = observer.best_split_suggestion(
            &VarianceReduction::default(),
            &TargetStats::default(),
            0,
            10,
        );
        assert!(suggestion.is_none());
    }

    #[test]
    fn non_finite_values_are_ignored() {
        let mut observer = AttributeSplitObserver::new(HistogramKind::Bins, 16, 10);
        observer.observe(f64::NAN, 1.0, 0.0, 1.0);
        observer.observe(f64::INFINITY, 1.0, 0.0, 1.0);
        assert_eq!(observer.total_count(), 0);
        observer.observe(1.0, 1.0, 0.0, 2.0);
        assert_eq!(observer.total_count(), 2);
    }

    #[test]
    fn finds_the_step_in_a_step_function() {
        for kind in [HistogramKind::Bins, HistogramKind::Sketch] {
            let mut observer = AttributeSplitObserver::new(kind, 64, 10);
            let observations: Vec<(f64, f64)> = (0..40)
                .map(|i| {
                    let x = f64::from(i);
                    (x, if x < 20.0 { -1.0 } else { 1.0 })
                })
                .collect();
            for &(x, y) in &observations {
                observer.observe(x, y, y, 1.0);
            }
            let pre = pre_split(&observations);
            let best = observer
                .best_split_suggestion(&VarianceReduction::default(), &pre, 4, 9)
                .unwrap();
            let test = best.test.unwrap();
            assert_eq!(test.feature, 4);
            match kind {
                HistogramKind::Bins => {
                    assert!(test.threshold >= 19.0 && test.threshold < 20.0, "{test:?}");
                    assert_abs_diff_eq!(best.merit, 1.0, epsilon = 1e-9);
                    assert_abs_diff_eq!(best.resulting[0].weight, 20.0, epsilon = 1e-9);
                }
                // Digest interpolation may land the cut one value off the step.
                HistogramKind::Sketch => {
                    assert!(test.threshold >= 18.0 && test.threshold <= 21.0, "{test:?}");
                    assert!(best.merit > 0.7, "{best:?}");
                }
            }
        }
    }

    #[test]
    fn split_distributions_preserve_total_weight() {
        let mut observer = AttributeSplitObserver::new(HistogramKind::Bins, 8, 4);
        for i in 0..100 {
            let x = f64::from(i % 13);
            observer.observe(x, x * 2.0, x / 6.0 - 1.0, 1.0);
        }
        for threshold in [-1.0, 3.3, 6.0, 12.0, 50.0] {
            let [left, right] = observer.split_distributions(threshold);
            assert_abs_diff_eq!(left.weight + right.weight, 100.0, epsilon = 1e-9);
        }
    }
}
