//! Change detection on split nodes and the bookkeeping of alternate subtrees.

use crate::config::DriftConfig;

/// Page-Hinckley test over a stream of error deviations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageHinckley {
    sum: f64,
    min: f64,
}

impl Default for PageHinckley {
    fn default() -> Self {
        Self {
            sum: 0.0,
            min: f64::MAX,
        }
    }
}

impl PageHinckley {
    /// Feed one deviation; true once the cumulative sum rose more than
    /// `threshold` above its running minimum.
    pub fn test(&mut self, deviation: f64, threshold: f64) -> bool {
        self.sum += deviation;
        self.min = self.min.min(self.sum);
        self.sum - self.min > threshold
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What an alternate subtree's owner should do after a loss comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlternateVerdict {
    Keep,
    Promote,
    Discard,
}

/// Unit steps applied one at a time before the rest of a heavy example is
/// folded in closed form.
const MAX_FADING_STEPS: f64 = 1024.0;

/// `steps` applications of `faded = loss + factor * faded`.
fn fade(faded: f64, loss: f64, factor: f64, steps: f64) -> f64 {
    if factor >= 1.0 {
        return faded + loss * steps;
    }
    let decay = factor.powf(steps);
    loss * (1.0 - decay) / (1.0 - factor) + decay * faded
}

/// Faded loss comparison between a split node's subtree and its alternate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AlternateLoss {
    examples_seen: f64,
    faded_original: f64,
    faded_alternate: f64,
    num_qi_tests: f64,
    sum_qi: f64,
    previous_weight: f64,
}

impl AlternateLoss {
    pub fn examples_seen(&self) -> f64 {
        self.examples_seen
    }

    fn qi(&self) -> f64 {
        (self.faded_original / self.faded_alternate).ln()
    }

    fn average_qi(&self) -> f64 {
        if self.num_qi_tests > 0.0 {
            self.sum_qi / self.num_qi_tests
        } else {
            0.0
        }
    }

    /// Record the squared losses of both subtrees for an example seen with
    /// `weight` and decide the alternate's fate.
    pub fn record(
        &mut self,
        loss_original: f64,
        loss_alternate: f64,
        weight: f64,
        grace_period: u32,
        config: &DriftConfig,
    ) -> AlternateVerdict {
        let previous_average = self.average_qi();
        let steps = weight.trunc();
        let stepped = steps.min(MAX_FADING_STEPS);
        for _ in 0..stepped as usize {
            self.faded_original = loss_original + config.fading_factor * self.faded_original;
            self.faded_alternate = loss_alternate + config.fading_factor * self.faded_alternate;
            self.examples_seen += 1.0;
            let qi = self.qi();
            if qi.is_finite() {
                self.sum_qi += qi;
                self.num_qi_tests += 1.0;
            }
        }
        let remaining = steps - stepped;
        if remaining > 0.0 {
            // Both faded losses sit at their fixed point by now, so every
            // remaining step adds the same Qi.
            self.faded_original =
                fade(self.faded_original, loss_original, config.fading_factor, remaining);
            self.faded_alternate =
                fade(self.faded_alternate, loss_alternate, config.fading_factor, remaining);
            self.examples_seen += remaining;
            let qi = self.qi();
            if qi.is_finite() {
                self.sum_qi += qi * remaining;
                self.num_qi_tests += remaining;
            }
        }
        if self.examples_seen - self.previous_weight < f64::from(config.t_min) {
            return AlternateVerdict::Keep;
        }
        self.previous_weight = self.examples_seen;
        let qi = self.qi();
        if qi > 0.0 {
            AlternateVerdict::Promote
        } else if (self.average_qi() < previous_average
            && self.examples_seen >= 10.0 * f64::from(grace_period))
            || self.examples_seen >= f64::from(config.alternate_time)
        {
            AlternateVerdict::Discard
        } else {
            AlternateVerdict::Keep
        }
    }
}
