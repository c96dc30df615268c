//! Online linear model fitted at every leaf of a model tree.

use std::fmt;
use std::mem::size_of;

use rand::Rng;

use crate::config::TreeConfig;
use crate::stats::GlobalStats;

/// A perceptron trained by stochastic gradient descent on tree-normalized
/// inputs and targets.
///
/// Weights hold one entry per feature plus a trailing bias and are drawn
/// uniformly from `[-1, 1)` on the first update. Until then the model predicts
/// the tree's running target mean.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Perceptron {
    weights: Vec<f64>,
    instances_seen: f64,
}

impl Perceptron {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this model for a freshly split child: same weights, fresh learning-rate schedule.
    pub fn child_copy(&self) -> Self {
        Self {
            weights: self.weights.clone(),
            instances_seen: 0.0,
        }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn is_initialized(&self) -> bool {
        !self.weights.is_empty()
    }

    pub fn instances_seen(&self) -> f64 {
        self.instances_seen
    }

    fn learning_rate(&self, config: &TreeConfig) -> f64 {
        if config.use_constant_learning_rate {
            config.learning_rate
        } else {
            config.learning_rate / (1.0 + self.instances_seen * config.learning_rate_decay)
        }
    }

    /// Train on `(x, y)` seen with `weight`; an integer weight `w` has the
    /// effect of `w` gradient steps, computed in one pass over the weights.
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        x: &[f64],
        y: f64,
        weight: f64,
        stats: &GlobalStats,
        config: &TreeConfig,
        rng: &mut R,
    ) {
        if !self.is_initialized() {
            self.weights = (0..=x.len()).map(|_| rng.random_range(-1.0..1.0)).collect();
            self.instances_seen = 0.0;
        }
        self.instances_seen += weight;
        let steps = weight.trunc();
        if steps < 1.0 {
            return;
        }
        let rate = self.learning_rate(config);
        let input = stats.normalize_instance(x);
        let norm = dot(&input, &input);
        if norm == 0.0 {
            return;
        }
        // Each step on the same input shrinks the residual by `1 - rate * |x|^2`,
        // so `steps` of them move the weights by a geometric sum along `x`.
        let delta = stats.normalize_target(y) - dot(&self.weights, &input);
        let travel = delta * (1.0 - (1.0 - rate * norm).powf(steps)) / norm;
        if !travel.is_finite() {
            return;
        }
        for (w, v) in self.weights.iter_mut().zip(&input) {
            *w += travel * v;
        }
    }

    /// Prediction on the normalized scale.
    pub fn predict_normalized(&self, x: &[f64], stats: &GlobalStats) -> f64 {
        dot(&self.weights, &stats.normalize_instance(x))
    }

    /// Prediction in target units.
    pub fn predict(&self, x: &[f64], stats: &GlobalStats) -> f64 {
        stats.denormalize_target(self.predict_normalized(x, stats))
    }

    pub fn byte_size(&self) -> usize {
        size_of::<Self>() + self.weights.capacity() * size_of::<f64>()
    }
}

fn dot(weights: &[f64], input: &[f64]) -> f64 {
    weights.iter().zip(input).map(|(w, v)| w * v).sum()
}

fn sign(value: f64) -> char {
    if value.is_sign_negative() { '-' } else { '+' }
}

/// Weights act on tree-normalized inputs, so the rendering says so.
impl fmt::Display for Perceptron {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((bias, features)) = self.weights.split_last() else {
            return write!(f, "y = mean");
        };
        write!(f, "norm(y) =")?;
        for (i, w) in features.iter().enumerate() {
            if i == 0 {
                write!(f, " {w:.4} * norm(x[{i}])")?;
            } else {
                write!(f, " {} {:.4} * norm(x[{i}])", sign(*w), w.abs())?;
            }
        }
        if features.is_empty() {
            write!(f, " {bias:.4}")
        } else {
            write!(f, " {} {:.4}", sign(*bias), bias.abs())
        }
    }
}
