//! Byte accounting and the memory governor.
//!
//! The governor keeps average byte sizes of active and inactive leaves,
//! sampled from the live tree, and compares their projection against
//! `max_bytes`. Over budget it either freezes all growth or keeps only the
//! most promising leaves active. Either way leaves change state in place, so
//! the number of leaves never changes during a pass.

use std::mem::size_of;

use tracing::{info, trace};

use crate::histogram::MergeableHistogram;
use crate::node::{Node, NodeId, NodeKind};
use crate::stats::Moments;
use crate::tree::FimtTree;

/// Upper bound on the leaves measured per estimate.
const MAX_SAMPLED_LEAVES: usize = 512;

impl FimtTree {
    /// Leaves of the main tree, left to right.
    pub(crate) fn find_leaves(&self) -> Vec<NodeId> {
        let mut leaves = Vec::with_capacity(self.leaf_count());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match &self.arena[id].kind {
                NodeKind::Split { children, .. } => stack.extend(children.iter().rev()),
                _ => leaves.push(id),
            }
        }
        leaves
    }

    /// Measured size of the tree in bytes, alternate subtrees included.
    pub fn byte_size(&self) -> usize {
        size_of::<Self>()
            + self.stats.features.capacity() * size_of::<Moments>()
            + self.arena.byte_size()
            + self
                .arena
                .iter()
                .map(|(_, node)| node.byte_size() - size_of::<Node>())
                .sum::<usize>()
    }

    /// Bytes held by the target histograms of the main tree's leaves.
    pub fn histogram_byte_size(&self) -> usize {
        self.find_leaves()
            .into_iter()
            .filter_map(|id| self.arena[id].leaf_model()?.label_histogram.as_ref())
            .map(|histogram| histogram.byte_size())
            .sum()
    }

    /// Projected leaf bytes under the current estimates.
    pub fn leaf_byte_estimate(&self) -> f64 {
        (self.active_leaf_count as f64 * self.active_leaf_byte_estimate
            + self.inactive_leaf_count as f64 * self.inactive_leaf_byte_estimate)
            * self.overhead_fraction
    }

    /// Re-estimate per-leaf byte sizes and the overhead fraction, then
    /// enforce the budget when the measured size exceeds it or growth is frozen.
    pub fn estimate_model_byte_sizes(&mut self) {
        let leaves = self.find_leaves();
        let stride = leaves.len().div_ceil(MAX_SAMPLED_LEAVES).max(1);
        let (mut active_bytes, mut active_sampled) = (0usize, 0usize);
        let (mut inactive_bytes, mut inactive_sampled) = (0usize, 0usize);
        for &id in leaves.iter().step_by(stride) {
            let node = &self.arena[id];
            if node.is_active_leaf() {
                active_bytes += node.byte_size();
                active_sampled += 1;
            } else {
                inactive_bytes += node.byte_size();
                inactive_sampled += 1;
            }
        }
        if active_sampled > 0 {
            self.active_leaf_byte_estimate = active_bytes as f64 / active_sampled as f64;
        }
        if inactive_sampled > 0 {
            self.inactive_leaf_byte_estimate = inactive_bytes as f64 / inactive_sampled as f64;
        }

        let actual = self.byte_size() as f64;
        let estimated = self.active_leaf_count as f64 * self.active_leaf_byte_estimate
            + self.inactive_leaf_count as f64 * self.inactive_leaf_byte_estimate;
        if estimated > 0.0 {
            self.overhead_fraction = actual / estimated;
        }
        trace!(
            active_leaf_bytes = self.active_leaf_byte_estimate,
            inactive_leaf_bytes = self.inactive_leaf_byte_estimate,
            overhead_fraction = self.overhead_fraction,
            actual_bytes = actual,
            "estimated model byte sizes"
        );
        if actual > self.config.max_bytes as f64 || !self.growth_allowed {
            self.enforce_tracker_limit(Some(actual));
        }
    }

    /// Bring the tree back under `max_bytes`, using `actual_size` instead of
    /// the projected leaf estimate when given.
    pub fn enforce_tracker_limit(&mut self, actual_size: Option<f64>) {
        let estimate = actual_size.unwrap_or_else(|| self.leaf_byte_estimate());
        let max_bytes = self.config.max_bytes as f64;
        let leaves_before = self.leaf_count();

        if self.config.stop_growth_on_budget {
            if estimate > max_bytes && self.active_leaf_count != 0 {
                self.growth_allowed = false;
                for id in self.find_leaves() {
                    self.deactivate_leaf(id);
                }
                info!(estimate, max_bytes, "memory budget exceeded, growth stopped");
            } else if !self.growth_allowed && max_bytes > estimate + self.active_leaf_byte_estimate {
                self.growth_allowed = true;
                for id in self.find_leaves() {
                    self.activate_leaf(id);
                }
                info!(estimate, max_bytes, "back under memory budget, growth resumed");
            }
        } else if self.inactive_leaf_count > 0 || estimate > max_bytes {
            let mut leaves = self.find_leaves();
            leaves.sort_by(|&a, &b| {
                let promise = |id: NodeId| self.arena[id].stats.promise();
                promise(a).total_cmp(&promise(b))
            });
            let max_active = self.max_active_leaves(leaves.len(), max_bytes);
            let cutoff = leaves.len() - max_active;
            let (mut deactivated, mut activated) = (0, 0);
            for &id in &leaves[..cutoff] {
                if self.deactivate_leaf(id) {
                    deactivated += 1;
                }
            }
            for &id in &leaves[cutoff..] {
                if self.activate_leaf(id) {
                    activated += 1;
                }
            }
            trace!(max_active, deactivated, activated, "enforced memory budget");
        }

        debug_assert_eq!(self.leaf_count(), leaves_before);
        debug_assert_eq!(self.leaf_count(), self.find_leaves().len());
    }

    /// Largest number of active leaves, at least one, whose projection fits `max_bytes`.
    fn max_active_leaves(&self, n_leaves: usize, max_bytes: f64) -> usize {
        let mut max_active = 0;
        while max_active < n_leaves {
            let projected = ((max_active + 1) as f64 * self.active_leaf_byte_estimate
                + (n_leaves - max_active - 1) as f64 * self.inactive_leaf_byte_estimate)
                * self.overhead_fraction;
            if projected > max_bytes {
                break;
            }
            max_active += 1;
        }
        max_active.clamp(1.min(n_leaves), n_leaves)
    }

    /// Freeze an active leaf of the main tree. False if it was not active.
    pub(crate) fn deactivate_leaf(&mut self, id: NodeId) -> bool {
        let changed = self.arena[id].deactivate();
        if changed {
            self.active_leaf_count -= 1;
            self.inactive_leaf_count += 1;
        }
        changed
    }

    /// Reactivate an inactive leaf of the main tree. False if it was not inactive.
    pub(crate) fn activate_leaf(&mut self, id: NodeId) -> bool {
        let changed = self.arena[id].activate();
        if changed {
            self.active_leaf_count += 1;
            self.inactive_leaf_count -= 1;
        }
        changed
    }
}
