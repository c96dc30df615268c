//! Running moments and the tree-global normalization they drive.
//!
//! Features and targets are scaled to `(v - mean) / (3 * sd)` using statistics
//! accumulated over everything the tree has seen. Degenerate statistics (one
//! example or zero spread) collapse to neutral values instead of dividing by zero.

/// Weighted count, sum and sum of squares of a stream of values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub weight: f64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl Moments {
    pub fn add(&mut self, value: f64, weight: f64) {
        self.weight += weight;
        self.sum += weight * value;
        self.sum_sq += weight * value * value;
    }

    pub fn mean(&self) -> f64 {
        if self.weight > 0.0 {
            self.sum / self.weight
        } else {
            0.0
        }
    }

    /// Population standard deviation; 0 with a single example or less.
    pub fn sd(&self) -> f64 {
        if self.weight > 1.0 {
            ((self.sum_sq - self.sum * self.sum / self.weight) / self.weight)
                .max(0.0)
                .sqrt()
        } else {
            0.0
        }
    }

    /// Scale `value` to `(value - mean) / (3 * sd)`, or 0 when degenerate.
    pub fn normalize(&self, value: f64) -> f64 {
        let sd = self.sd();
        if self.weight > 1.0 && sd > 0.0 {
            (value - self.mean()) / (3.0 * sd)
        } else {
            0.0
        }
    }

    /// Inverse of [`normalize`](Self::normalize); the mean when degenerate.
    pub fn denormalize(&self, normalized: f64) -> f64 {
        let sd = self.sd();
        if self.weight > 1.0 && sd > 0.0 {
            normalized * 3.0 * sd + self.mean()
        } else {
            self.mean()
        }
    }

    /// `|difference|` expressed in units of `3 * sd`, or 0 when degenerate.
    pub fn scale_abs(&self, difference: f64) -> f64 {
        let sd = self.sd();
        if self.weight > 1.0 && sd > 0.0 {
            difference.abs() / (3.0 * sd)
        } else {
            0.0
        }
    }
}

/// Tree-global running statistics of the target and of every feature.
#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    pub(crate) target: Moments,
    pub(crate) features: Vec<Moments>,
    pub(crate) instances_seen: u64,
}

impl GlobalStats {
    pub(crate) fn with_features(n_features: usize) -> Self {
        Self {
            target: Moments::default(),
            features: vec![Moments::default(); n_features],
            instances_seen: 0,
        }
    }

    pub(crate) fn update(&mut self, x: &[f64], y: f64, weight: f64) {
        self.instances_seen += 1;
        self.target.add(y, weight);
        for (moments, &v) in self.features.iter_mut().zip(x) {
            if v.is_finite() {
                moments.add(v, weight);
            }
        }
    }

    pub fn target(&self) -> &Moments {
        &self.target
    }

    pub fn feature(&self, index: usize) -> Option<&Moments> {
        self.features.get(index)
    }

    pub fn weight_seen(&self) -> f64 {
        self.target.weight
    }

    pub fn instances_seen(&self) -> u64 {
        self.instances_seen
    }

    pub fn normalize_target(&self, y: f64) -> f64 {
        self.target.normalize(y)
    }

    pub fn denormalize_target(&self, normalized: f64) -> f64 {
        self.target.denormalize(normalized)
    }

    /// Normalized feature vector with a trailing bias input.
    ///
    /// NaN and infinite features normalize to 0. The bias input is 1 once the tree has
    /// seen more than one example, 0 before.
    pub fn normalize_instance(&self, x: &[f64]) -> Vec<f64> {
        let mut normalized: Vec<f64> = self
            .features
            .iter()
            .zip(x)
            .map(|(moments, &v)| if v.is_finite() { moments.normalize(v) } else { 0.0 })
            .collect();
        normalized.push(if self.target.weight > 1.0 { 1.0 } else { 0.0 });
        normalized
    }
}
