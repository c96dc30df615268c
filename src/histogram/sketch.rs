use std::mem::size_of;

use tdigests::{Centroid, TDigest};

use super::MergeableHistogram;

const MIN_CENTROIDS: usize = 2;

/// Rank-based quantile sketch backed by a t-digest.
///
/// Every insertion is folded into the digest as a weighted centroid. Once the
/// digest holds more than twice `max_centroids` centroids it is compressed
/// back down to `max_centroids`. The exact count and range are tracked beside
/// the digest, since centroid weights only approximate positions of mass.
#[derive(Debug, Clone)]
pub struct QuantileSketch {
    max_centroids: usize,
    digest: Option<TDigest>,
    count: u64,
    min: f64,
    max: f64,
}

impl QuantileSketch {
    pub fn new(max_centroids: usize) -> Self {
        Self {
            max_centroids: max_centroids.max(MIN_CENTROIDS),
            digest: None,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Centroids currently held by the digest.
    pub fn num_centroids(&self) -> usize {
        self.digest
            .as_ref()
            .map_or(0, |digest| digest.centroids().len())
    }

    /// Smallest value inserted so far.
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest value inserted so far.
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    fn absorb(&mut self, incoming: &TDigest) {
        let mut merged = match self.digest.take() {
            Some(existing) => existing.merge(incoming),
            None => incoming.clone(),
        };
        if merged.centroids().len() > 2 * self.max_centroids {
            merged.compress(self.max_centroids);
        }
        self.digest = Some(merged);
    }

    /// Value at quantile `q`, kept inside the observed range.
    fn estimate(&self, q: f64) -> Option<f64> {
        let digest = self.digest.as_ref()?;
        Some(digest.estimate_quantile(q.clamp(0.0, 1.0)).clamp(self.min, self.max))
    }

    pub(crate) fn point_at_rank(&self, rank: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        self.estimate(rank / self.count as f64)
    }
}

impl PartialEq for QuantileSketch {
    fn eq(&self, other: &Self) -> bool {
        self.max_centroids == other.max_centroids
            && self.count == other.count
            && self.weighted_points() == other.weighted_points()
    }
}

impl MergeableHistogram for QuantileSketch {
    fn insert_weighted(&mut self, value: f64, count: u64) {
        if count == 0 || !value.is_finite() {
            return;
        }
        self.absorb(&TDigest::from_centroids(vec![Centroid::new(
            value,
            count as f64,
        )]));
        self.count += count;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: &Self) {
        let Some(incoming) = &other.digest else {
            return;
        };
        self.absorb(incoming);
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    fn uniform(&self, k: usize) -> Vec<f64> {
        let mut previous = f64::NEG_INFINITY;
        (1..=k)
            .map_while(|j| self.estimate(j as f64 / (k + 1) as f64))
            .map(|point| {
                previous = point.max(previous);
                previous
            })
            .collect()
    }

    fn total_count(&self) -> u64 {
        self.count
    }

    /// Weight of the centroids whose mean is at most `p`.
    fn sum_at_or_below(&self, p: f64) -> f64 {
        let Some(digest) = &self.digest else {
            return 0.0;
        };
        if p.is_nan() {
            return 0.0;
        }
        let below: f64 = digest
            .centroids()
            .iter()
            .filter(|centroid| centroid.mean <= p)
            .map(|centroid| centroid.weight)
            .sum();
        below.min(self.count as f64)
    }

    fn weighted_points(&self) -> Vec<(f64, u64)> {
        let Some(digest) = &self.digest else {
            return Vec::new();
        };
        let mut points: Vec<(f64, u64)> = digest
            .centroids()
            .iter()
            .map(|centroid| (centroid.mean, centroid.weight.round() as u64))
            .filter(|&(_, weight)| weight > 0)
            .collect();
        points.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
        points
    }

    fn byte_size(&self) -> usize {
        size_of::<Self>() + self.num_centroids() * size_of::<Centroid>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn compression_keeps_weight_and_bounds_centroids() {
        let mut sketch = QuantileSketch::new(12);
        for i in 0..10_000u32 {
            sketch.insert(f64::from(i));
        }
        let weight: u64 = sketch.weighted_points().iter().map(|&(_, w)| w).sum();
        assert_eq!(weight, 10_000);
        assert_eq!(sketch.total_count(), 10_000);
        assert!(sketch.num_centroids() <= 24);
        assert_eq!(sketch.min(), Some(0.0));
        assert_eq!(sketch.max(), Some(9_999.0));
    }

    #[test]
    fn weighted_insert_is_one_heavy_centroid() {
        let mut sketch = QuantileSketch::new(64);
        sketch.insert_weighted(4.0, 5);
        assert_eq!(sketch.total_count(), 5);
        assert_eq!(sketch.weighted_points(), vec![(4.0, 5)]);
        assert_eq!(sketch.sum_at_or_below(4.0), 5.0);
        assert_eq!(sketch.sum_at_or_below(3.9), 0.0);
    }

    #[test]
    fn small_streams_stay_close_to_exact() {
        let mut sketch = QuantileSketch::new(64);
        for v in [5.0, 1.0, 3.0, 2.0, 4.0] {
            sketch.insert(v);
        }
        assert!(sketch.num_centroids() <= 5);
        assert_abs_diff_eq!(sketch.sum_at_or_below(3.0), 3.0, epsilon = 1.0);
        assert_eq!(sketch.sum_at_or_below(5.0), 5.0);
        let points = sketch.uniform(4);
        assert_eq!(points.len(), 4);
        for (point, expected) in points.iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert_abs_diff_eq!(*point, expected, epsilon = 1.0);
        }
    }

    #[test]
    fn identical_streams_build_identical_sketches() {
        let build = || {
            let mut sketch = QuantileSketch::new(8);
            for i in 0..1000u32 {
                sketch.insert(f64::from(i % 37));
            }
            sketch
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn empty_sketch_answers_nothing() {
        let sketch = QuantileSketch::new(8);
        assert!(sketch.uniform(3).is_empty());
        assert_eq!(sketch.point_at_rank(1.0), None);
        assert_eq!(sketch.sum_at_or_below(1.0), 0.0);
    }
}
