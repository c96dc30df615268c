//! Split tests, split suggestions and the criteria that score them.

use std::cmp::Ordering;
use std::fmt;

use crate::stats::Moments;

/// Target distribution on one side of a split: weight, sum and sum of squares.
pub type TargetStats = Moments;

/// Scores a candidate split from the target distribution before and after it.
pub trait SplitCriterion: fmt::Debug + Send + Sync {
    /// Merit of partitioning `pre` into `post`; higher is better.
    fn merit_of_split(&self, pre: &TargetStats, post: &[TargetStats]) -> f64;

    /// Range of the merit, used by the Hoeffding bound.
    fn range_of_merit(&self, pre: &TargetStats) -> f64;
}

/// Standard deviation reduction.
///
/// A split only earns merit when every branch holds at least
/// `min_branch_weight` examples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarianceReduction {
    pub min_branch_weight: f64,
}

impl Default for VarianceReduction {
    fn default() -> Self {
        Self {
            min_branch_weight: 5.0,
        }
    }
}

impl SplitCriterion for VarianceReduction {
    fn merit_of_split(&self, pre: &TargetStats, post: &[TargetStats]) -> f64 {
        if pre.weight <= 0.0 || post.iter().any(|side| side.weight < self.min_branch_weight) {
            return 0.0;
        }
        let n = pre.weight;
        post.iter()
            .fold(pre.sd(), |sdr, side| sdr - side.weight / n * side.sd())
    }

    fn range_of_merit(&self, _pre: &TargetStats) -> f64 {
        1.0
    }
}

/// Hoeffding bound `sqrt(range^2 * ln(1 / confidence) / (2n))`.
///
/// With probability `1 - confidence`, the true mean of a variable with the
/// given `range` lies within this distance of the mean of `n` samples.
pub fn compute_hoeffding_bound(range: f64, confidence: f64, n: f64) -> f64 {
    ((range * range * (1.0 / confidence).ln()) / (2.0 * n)).sqrt()
}

/// Binary test on one numeric feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitTest {
    pub feature: usize,
    pub threshold: f64,
}

impl SplitTest {
    /// Branch 0 when `x[feature] <= threshold`, branch 1 otherwise (NaN included).
    pub fn branch_for(&self, x: &[f64]) -> usize {
        match x.get(self.feature) {
            Some(&v) if v <= self.threshold => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for SplitTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x[{}] <= {:.4}", self.feature, self.threshold)
    }
}

/// A scored candidate. `test == None` stands for "do not split".
#[derive(Debug, Clone, PartialEq)]
pub struct SplitSuggestion {
    pub test: Option<SplitTest>,
    pub merit: f64,
    pub resulting: [TargetStats; 2],
}

impl SplitSuggestion {
    /// The "no split" candidate, scored against the unsplit distribution.
    pub fn no_split(criterion: &dyn SplitCriterion, pre: &TargetStats) -> Self {
        Self {
            test: None,
            merit: criterion.merit_of_split(pre, std::slice::from_ref(pre)),
            resulting: [*pre, TargetStats::default()],
        }
    }

    pub(crate) fn cmp_merit(&self, other: &Self) -> Ordering {
        self.merit.total_cmp(&other.merit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn stats(values: &[f64]) -> TargetStats {
        let mut m = TargetStats::default();
        for &v in values {
            m.add(v, 1.0);
        }
        m
    }

    #[test]
    fn hoeffding_bound_decreases_with_n_and_grows_with_range() {
        let mut previous = f64::INFINITY;
        for n in [1.0, 2.0, 10.0, 200.0, 1e4, 1e8] {
            let bound = compute_hoeffding_bound(1.0, 1e-7, n);
            assert!(bound < previous);
            assert!(bound > 0.0);
            previous = bound;
        }
        let narrow = compute_hoeffding_bound(0.5, 0.1, 50.0);
        let wide = compute_hoeffding_bound(2.0, 0.1, 50.0);
        assert!(narrow < wide);
        assert_abs_diff_eq!(
            compute_hoeffding_bound(1.0, 0.1, 2.0),
            (10f64.ln() / 4.0).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn separating_split_has_full_merit() {
        let left = stats(&[0.0; 6]);
        let right = stats(&[10.0; 6]);
        let mut pre = left;
        pre.weight += right.weight;
        pre.sum += right.sum;
        pre.sum_sq += right.sum_sq;
        let merit = VarianceReduction::default().merit_of_split(&pre, &[left, right]);
        assert_abs_diff_eq!(merit, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn small_branches_earn_nothing() {
        let pre = stats(&[0.0, 0.0, 10.0, 10.0]);
        let merit =
            VarianceReduction::default().merit_of_split(&pre, &[stats(&[0.0, 0.0]), stats(&[10.0, 10.0])]);
        assert_eq!(merit, 0.0);
    }

    #[test]
    fn no_split_scores_zero_reduction() {
        let pre = stats(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let suggestion = SplitSuggestion::no_split(&VarianceReduction::default(), &pre);
        assert!(suggestion.test.is_none());
        assert_abs_diff_eq!(suggestion.merit, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn nan_routes_right() {
        let test = SplitTest {
            feature: 1,
            threshold: 0.5,
        };
        assert_eq!(test.branch_for(&[9.0, 0.5]), 0);
        assert_eq!(test.branch_for(&[9.0, 0.6]), 1);
        assert_eq!(test.branch_for(&[9.0, f64::NAN]), 1);
    }
}
