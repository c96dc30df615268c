use std::mem::size_of;

use super::MergeableHistogram;

/// One centroid of a [`StreamingHistogram`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    pub value: f64,
    pub count: u64,
}

/// Bounded-bin streaming histogram.
///
/// Keeps at most `max_bins` centroids sorted by value. Inserting a new value
/// beyond capacity fuses the two closest centroids into their weighted mean.
/// Cumulative counts and uniform points are interpolated between centroids
/// assuming mass is spread trapezoidally between neighbours.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingHistogram {
    max_bins: usize,
    bins: Vec<Bin>,
    total: u64,
    min: f64,
    max: f64,
}

impl StreamingHistogram {
    pub fn new(max_bins: usize) -> Self {
        let max_bins = max_bins.max(1);
        Self {
            max_bins,
            bins: Vec::with_capacity(max_bins + 1),
            total: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// Smallest value inserted so far.
    pub fn min(&self) -> Option<f64> {
        (self.total > 0).then_some(self.min)
    }

    /// Largest value inserted so far.
    pub fn max(&self) -> Option<f64> {
        (self.total > 0).then_some(self.max)
    }

    fn shrink(&mut self) {
        while self.bins.len() > self.max_bins {
            let mut closest = 0;
            let mut gap = f64::INFINITY;
            for (i, pair) in self.bins.windows(2).enumerate() {
                let d = pair[1].value - pair[0].value;
                if d < gap {
                    gap = d;
                    closest = i;
                }
            }
            let right = self.bins.remove(closest + 1);
            let left = &mut self.bins[closest];
            let count = left.count + right.count;
            left.value = (left.value * left.count as f64 + right.value * right.count as f64)
                / count as f64;
            left.count = count;
        }
    }

    /// Approximate count at or below each centroid: everything before it plus half its own mass.
    fn centroid_sums(&self) -> Vec<f64> {
        let mut prefix = 0.0;
        self.bins
            .iter()
            .map(|bin| {
                let m = bin.count as f64;
                let s = prefix + m / 2.0;
                prefix += m;
                s
            })
            .collect()
    }

    /// The value below which roughly `rank` of the inserted mass lies.
    pub(crate) fn point_at_rank(&self, rank: f64) -> Option<f64> {
        let sums = self.centroid_sums();
        self.solve_rank(&sums, rank)
    }

    fn solve_rank(&self, sums: &[f64], rank: f64) -> Option<f64> {
        let first = self.bins.first()?;
        let last = self.bins.last()?;
        if rank <= sums[0] {
            return Some(first.value.max(self.min));
        }
        if rank >= sums[sums.len() - 1] {
            return Some(last.value.min(self.max));
        }
        let i = sums.partition_point(|&s| s <= rank) - 1;
        let (lo, hi) = (self.bins[i], self.bins[i + 1]);
        let d = rank - sums[i];
        let (mi, mj) = (lo.count as f64, hi.count as f64);
        // Solve d = mi * z + (mj - mi) * z^2 / 2 for the fraction z of the gap.
        let a = mj - mi;
        let b = 2.0 * mi;
        let c = -2.0 * d;
        let z = if a.abs() < f64::EPSILON {
            -c / b
        } else {
            (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a)
        };
        Some(lo.value + (hi.value - lo.value) * z.clamp(0.0, 1.0))
    }
}

impl MergeableHistogram for StreamingHistogram {
    fn insert_weighted(&mut self, value: f64, count: u64) {
        if count == 0 || !value.is_finite() {
            return;
        }
        match self.bins.binary_search_by(|bin| bin.value.total_cmp(&value)) {
            Ok(i) => self.bins[i].count += count,
            Err(i) => self.bins.insert(i, Bin { value, count }),
        }
        self.total += count;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.shrink();
    }

    fn merge(&mut self, other: &Self) {
        if other.total == 0 {
            return;
        }
        let mut fused: Vec<Bin> = Vec::with_capacity(self.bins.len() + other.bins.len());
        let (mut i, mut j) = (0, 0);
        while i < self.bins.len() || j < other.bins.len() {
            let next = match (self.bins.get(i), other.bins.get(j)) {
                (Some(a), Some(b)) if a.value <= b.value => {
                    i += 1;
                    *a
                }
                (_, Some(b)) => {
                    j += 1;
                    *b
                }
                (Some(a), None) => {
                    i += 1;
                    *a
                }
                (None, None) => break,
            };
            match fused.last_mut() {
                Some(prev) if prev.value == next.value => prev.count += next.count,
                _ => fused.push(next),
            }
        }
        self.bins = fused;
        self.total += other.total;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.shrink();
    }

    fn uniform(&self, k: usize) -> Vec<f64> {
        if self.bins.is_empty() || k == 0 {
            return Vec::new();
        }
        let sums = self.centroid_sums();
        let total = self.total as f64;
        let mut points = Vec::with_capacity(k);
        let mut previous = f64::NEG_INFINITY;
        for j in 1..=k {
            let rank = j as f64 * total / (k + 1) as f64;
            if let Some(point) = self.solve_rank(&sums, rank) {
                previous = point.max(previous);
                points.push(previous);
            }
        }
        points
    }

    fn total_count(&self) -> u64 {
        self.total
    }

    fn sum_at_or_below(&self, p: f64) -> f64 {
        let (Some(first), Some(last)) = (self.bins.first(), self.bins.last()) else {
            return 0.0;
        };
        if p.is_nan() || p < first.value {
            return 0.0;
        }
        if p >= last.value {
            return self.total as f64;
        }
        let i = self.bins.partition_point(|bin| bin.value <= p) - 1;
        let (lo, hi) = (self.bins[i], self.bins[i + 1]);
        let before: u64 = self.bins[..i].iter().map(|bin| bin.count).sum();
        let (mi, mj) = (lo.count as f64, hi.count as f64);
        let frac = (p - lo.value) / (hi.value - lo.value);
        let mp = mi + (mj - mi) * frac;
        before as f64 + mi / 2.0 + (mi + mp) / 2.0 * frac
    }

    fn weighted_points(&self) -> Vec<(f64, u64)> {
        self.bins.iter().map(|bin| (bin.value, bin.count)).collect()
    }

    fn byte_size(&self) -> usize {
        size_of::<Self>() + self.bins.capacity() * size_of::<Bin>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn keeps_at_most_max_bins() {
        let mut h = StreamingHistogram::new(5);
        for i in 0..100 {
            h.insert(f64::from(i));
        }
        assert_eq!(h.bins().len(), 5);
        assert_eq!(h.total_count(), 100);
        assert_eq!(h.bins().iter().map(|b| b.count).sum::<u64>(), 100);
        assert_eq!(h.min(), Some(0.0));
        assert_eq!(h.max(), Some(99.0));
    }

    #[test]
    fn repeated_values_share_a_bin() {
        let mut h = StreamingHistogram::new(4);
        for _ in 0..10 {
            h.insert(3.0);
        }
        h.insert_weighted(1.0, 5);
        assert_eq!(h.bins(), &[Bin { value: 1.0, count: 5 }, Bin { value: 3.0, count: 10 }]);
    }

    #[test]
    fn closest_bins_fuse_into_weighted_mean() {
        let mut h = StreamingHistogram::new(2);
        h.insert_weighted(0.0, 1);
        h.insert_weighted(10.0, 3);
        h.insert_weighted(11.0, 1);
        assert_eq!(h.bins().len(), 2);
        assert_abs_diff_eq!(h.bins()[1].value, 10.25);
        assert_eq!(h.bins()[1].count, 4);
    }

    #[test]
    fn interpolated_sum_between_unit_bins() {
        let mut h = StreamingHistogram::new(64);
        for i in 1..=20 {
            h.insert(f64::from(i));
        }
        // Half of the first bin sits at or below its own centroid.
        assert_abs_diff_eq!(h.sum_at_or_below(1.0), 0.5);
        assert_abs_diff_eq!(h.sum_at_or_below(10.5), 10.0);
        assert_abs_diff_eq!(h.sum_at_or_below(20.0), 20.0);
        assert_abs_diff_eq!(h.uniform(1)[0], 10.5, epsilon = 1e-9);
    }

    #[test]
    fn merge_of_aligned_bins_adds_counts() {
        let mut a = StreamingHistogram::new(8);
        let mut b = StreamingHistogram::new(8);
        for v in [1.0, 2.0, 3.0] {
            a.insert(v);
            b.insert(v);
        }
        a.merge(&b);
        assert_eq!(a.bins().len(), 3);
        assert!(a.bins().iter().all(|bin| bin.count == 2));
        assert_eq!(a.total_count(), 6);
    }
}
