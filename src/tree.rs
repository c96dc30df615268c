//! The incremental model tree.

use std::fmt;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::FeatureVector;
use crate::config::TreeConfig;
use crate::criterion::{
    SplitCriterion, SplitSuggestion, SplitTest, VarianceReduction, compute_hoeffding_bound,
};
use crate::drift::AlternateVerdict;
use crate::error::{FimtError, Result};
use crate::histogram::Histogram;
use crate::node::{Alternate, Arena, LeafModel, Node, NodeId, NodeKind, NodeStats, ParentLink, Slot};
use crate::stats::GlobalStats;

/// Fast incremental model tree for regression on data streams.
///
/// Each call to [`train`](Self::train) routes one example to a leaf, updates
/// the statistics on its path and, every `grace_period` examples at a leaf,
/// decides with a Hoeffding bound whether the leaf's best split candidate is
/// reliably better than the alternatives.
#[derive(Debug)]
pub struct FimtTree {
    pub(crate) config: TreeConfig,
    pub(crate) criterion: Box<dyn SplitCriterion>,
    pub(crate) arena: Arena,
    pub(crate) root: NodeId,
    pub(crate) stats: GlobalStats,
    pub(crate) n_features: Option<usize>,
    pub(crate) rng: StdRng,
    pub(crate) active_leaf_count: usize,
    pub(crate) inactive_leaf_count: usize,
    pub(crate) split_node_count: usize,
    pub(crate) active_leaf_byte_estimate: f64,
    pub(crate) inactive_leaf_byte_estimate: f64,
    pub(crate) overhead_fraction: f64,
    pub(crate) growth_allowed: bool,
}

/// Snapshot of one leaf of the main tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafSummary {
    pub id: NodeId,
    pub active: bool,
    pub depth: usize,
    pub stats: NodeStats,
}

/// Size and shape diagnostics of a tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeMeasurements {
    pub node_count: usize,
    pub leaf_count: usize,
    pub active_leaf_count: usize,
    pub inactive_leaf_count: usize,
    pub split_node_count: usize,
    pub depth: usize,
    pub active_leaf_byte_estimate: f64,
    pub inactive_leaf_byte_estimate: f64,
    pub overhead_fraction: f64,
    /// Leaf byte estimate scaled by the overhead fraction.
    pub leaf_byte_estimate: f64,
    /// Measured size of the whole tree.
    pub byte_size: usize,
    pub histogram_byte_size: usize,
}

impl FimtTree {
    /// Build a tree splitting by standard deviation reduction.
    pub fn new(config: TreeConfig) -> Result<Self> {
        Self::with_criterion(config, Box::new(VarianceReduction::default()))
    }

    pub fn with_criterion(config: TreeConfig, criterion: Box<dyn SplitCriterion>) -> Result<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        let mut arena = Arena::default();
        let root = arena.insert(Node::leaf(
            LeafModel::new(&config),
            None,
            config.drift.enabled,
        ));
        Ok(Self {
            config,
            criterion,
            arena,
            root,
            stats: GlobalStats::default(),
            n_features: None,
            rng,
            active_leaf_count: 1,
            inactive_leaf_count: 0,
            split_node_count: 0,
            active_leaf_byte_estimate: 0.0,
            inactive_leaf_byte_estimate: 0.0,
            overhead_fraction: 1.0,
            growth_allowed: true,
        })
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn global_stats(&self) -> &GlobalStats {
        &self.stats
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    pub fn active_leaf_count(&self) -> usize {
        self.active_leaf_count
    }

    pub fn inactive_leaf_count(&self) -> usize {
        self.inactive_leaf_count
    }

    pub fn leaf_count(&self) -> usize {
        self.active_leaf_count + self.inactive_leaf_count
    }

    pub fn split_node_count(&self) -> usize {
        self.split_node_count
    }

    pub fn node_count(&self) -> usize {
        self.leaf_count() + self.split_node_count
    }

    pub fn growth_allowed(&self) -> bool {
        self.growth_allowed
    }

    /// Train on one example. `weight` is the example's multiplicity.
    ///
    /// # Errors
    ///
    /// Rejects a NaN or infinite target, a negative or non-finite weight, and instances
    /// whose length differs from the first one the tree was trained on.
    pub fn train(&mut self, x: &FeatureVector, y: f64, weight: f64) -> Result<()> {
        if !y.is_finite() {
            return Err(FimtError::NonFiniteTarget(y));
        }
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(FimtError::InvalidWeight(weight));
        }
        match self.n_features {
            Some(expected) if expected != x.len() => {
                return Err(FimtError::DimensionMismatch {
                    expected,
                    got: x.len(),
                });
            }
            Some(_) => {}
            None => {
                self.n_features = Some(x.len());
                self.stats = GlobalStats::with_features(x.len());
            }
        }
        if weight == 0.0 {
            return Ok(());
        }

        self.stats.update(x, y, weight);
        let prediction = self.predict_from(self.root, x);
        let normal_error = self.stats.target().scale_abs(y - prediction);
        self.process_instance(self.root, x, y, weight, prediction, normal_error, false);

        if self.config.memory_management
            && self.stats.instances_seen() % u64::from(self.config.memory_estimate_period) == 0
        {
            self.estimate_model_byte_sizes();
        }
        Ok(())
    }

    /// Point prediction for `x`.
    ///
    /// An instance of the wrong length yields the running target mean.
    pub fn predict(&self, x: &FeatureVector) -> f64 {
        if !self.check_dimension(x) {
            return self.stats.target().mean();
        }
        self.predict_from(self.root, x)
    }

    /// Target histogram of the leaf `x` falls into, when quantile leaves are enabled.
    pub fn predict_histogram(&self, x: &FeatureVector) -> Option<&Histogram> {
        if !self.check_dimension(x) {
            return None;
        }
        let leaf = self.leaf_for(self.root, x);
        self.arena[leaf].leaf_model()?.label_histogram.as_ref()
    }

    fn check_dimension(&self, x: &FeatureVector) -> bool {
        match self.n_features {
            Some(expected) if expected != x.len() => {
                warn!(expected, got = x.len(), "prediction requested with mismatched dimension");
                false
            }
            _ => true,
        }
    }

    pub(crate) fn leaf_for(&self, start: NodeId, x: &FeatureVector) -> NodeId {
        let mut current = start;
        while let NodeKind::Split { test, children, .. } = &self.arena[current].kind {
            current = children[test.branch_for(x)];
        }
        current
    }

    pub(crate) fn predict_from(&self, start: NodeId, x: &FeatureVector) -> f64 {
        self.leaf_prediction(self.leaf_for(start, x), x)
    }

    fn leaf_prediction(&self, leaf: NodeId, x: &FeatureVector) -> f64 {
        match self.arena[leaf].leaf_model() {
            Some(model) if self.config.build_linear_leaf_model => {
                model.perceptron.predict(x, &self.stats)
            }
            _ => self.mean_prediction(leaf),
        }
    }

    /// Target mean of the nearest node on the path to the root that has seen examples.
    fn mean_prediction(&self, from: NodeId) -> f64 {
        let mut current = Some(from);
        while let Some(id) = current {
            let node = &self.arena[id];
            if let Some(mean) = node.stats.mean() {
                return mean;
            }
            current = node.parent.map(|link| link.parent);
        }
        self.stats.target().mean()
    }

    #[allow(clippy::too_many_arguments)]
    fn process_instance(
        &mut self,
        start: NodeId,
        x: &FeatureVector,
        y: f64,
        weight: f64,
        prediction: f64,
        normal_error: f64,
        in_alternate: bool,
    ) {
        let mut current = start;
        loop {
            if self.arena[current].is_leaf() {
                self.learn_at_leaf(current, x, y, weight, in_alternate);
                return;
            }
            self.arena[current].stats.add(y, weight, normal_error);
            if !in_alternate {
                if let Some(promoted) =
                    self.evaluate_alternate(current, x, y, weight, prediction, normal_error)
                {
                    current = promoted;
                    continue;
                }
                self.detect_change(current, normal_error);
            }
            current = self.descend_one_step(current, x);
        }
    }

    fn descend_one_step(&self, split: NodeId, x: &FeatureVector) -> NodeId {
        match &self.arena[split].kind {
            NodeKind::Split { test, children, .. } => children[test.branch_for(x)],
            _ => split,
        }
    }

    fn learn_at_leaf(&mut self, id: NodeId, x: &FeatureVector, y: f64, weight: f64, in_alternate: bool) {
        let abs_error = self.stats.target().scale_abs(y - self.leaf_prediction(id, x));
        let grace_period = f64::from(self.config.grace_period);
        let growth_allowed = self.growth_allowed;
        let node = &mut self.arena[id];
        node.stats.add(y, weight, abs_error);
        let examples_seen = node.stats.examples_seen;
        let attempt = match &mut node.kind {
            NodeKind::ActiveLeaf(leaf) => {
                leaf.model.learn(x, y, weight, &self.stats, &self.config, &mut self.rng);
                leaf.observe(x, y, weight, &self.stats, &self.config, &mut self.rng);
                let due = examples_seen - leaf.examples_seen_at_last_split_eval >= grace_period;
                if growth_allowed && due {
                    leaf.examples_seen_at_last_split_eval = examples_seen;
                }
                growth_allowed && due
            }
            NodeKind::InactiveLeaf(model) => {
                model.learn(x, y, weight, &self.stats, &self.config, &mut self.rng);
                false
            }
            NodeKind::Split { .. } => false,
        };
        if attempt {
            self.attempt_split(id, in_alternate);
        }
    }

    /// Rank the leaf's split candidates and split, deactivate or wait.
    fn attempt_split(&mut self, id: NodeId, in_alternate: bool) {
        let node = &self.arena[id];
        let NodeKind::ActiveLeaf(leaf) = &node.kind else {
            return;
        };
        let criterion = self.criterion.as_ref();
        let pre_split = node.stats.target_stats();
        let mut suggestions = leaf.best_split_suggestions(
            criterion,
            &pre_split,
            self.config.num_split_candidates as usize,
        );
        if self.config.pre_prune {
            suggestions.push(SplitSuggestion::no_split(criterion, &pre_split));
        }
        // Ascending by merit; "no split" sorts last among equals.
        suggestions.sort_by(|a, b| {
            a.cmp_merit(b)
                .then_with(|| a.test.is_none().cmp(&b.test.is_none()))
        });

        let (decision, bound) = match suggestions.as_slice() {
            [] => (None, None),
            [only] => ((!self.config.pre_prune).then(|| only.clone()), None),
            [.., second, best] => {
                let bound = compute_hoeffding_bound(
                    criterion.range_of_merit(&pre_split),
                    self.config.split_confidence,
                    pre_split.weight,
                );
                let split = second.merit / best.merit < 1.0 - bound
                    || bound < self.config.tie_threshold;
                (split.then(|| best.clone()), Some(bound))
            }
        };
        let Some(decision) = decision else {
            return;
        };

        let in_main_tree = !in_alternate && self.in_main_tree(id);
        match decision.test {
            None => {
                debug!(node = id.index(), "no split outranks every candidate, deactivating leaf");
                if self.arena[id].deactivate() && in_main_tree {
                    self.active_leaf_count -= 1;
                    self.inactive_leaf_count += 1;
                }
            }
            Some(test) => {
                debug!(
                    node = id.index(),
                    feature = test.feature,
                    threshold = test.threshold,
                    merit = decision.merit,
                    hoeffding_bound = bound,
                    "splitting leaf"
                );
                self.split_leaf(id, test);
                if in_main_tree {
                    self.split_node_count += 1;
                    self.active_leaf_count += 1;
                }
            }
        }
        if self.config.memory_management {
            self.enforce_tracker_limit(None);
        }
    }

    /// Replace an active leaf by a split node over two fresh active leaves.
    ///
    /// Children are inserted before the leaf is rewritten in place, so the
    /// node is never a split without both children.
    fn split_leaf(&mut self, id: NodeId, test: SplitTest) {
        let change_detection = self.arena[id].change_detection;
        let NodeKind::ActiveLeaf(leaf) = &self.arena[id].kind else {
            return;
        };
        let models = [
            leaf.model.for_child(&self.config),
            leaf.model.for_child(&self.config),
        ];
        let mut children = [id; 2];
        for (branch, model) in models.into_iter().enumerate() {
            let link = ParentLink {
                parent: id,
                slot: Slot::Child(branch),
            };
            children[branch] = self
                .arena
                .insert(Node::leaf(model, Some(link), change_detection));
        }
        self.arena[id].kind = NodeKind::Split {
            test,
            children,
            detector: Default::default(),
            alternate: None,
        };
    }

    /// False for nodes inside an alternate subtree.
    pub(crate) fn in_main_tree(&self, id: NodeId) -> bool {
        let mut current = self.arena[id].parent;
        while let Some(link) = current {
            if link.slot == Slot::Alternate {
                return false;
            }
            current = self.arena[link.parent].parent;
        }
        true
    }

    fn detect_change(&mut self, id: NodeId, normal_error: f64) {
        let drift = &self.config.drift;
        let node = &mut self.arena[id];
        if !drift.enabled || !node.change_detection || node.stats.examples_seen <= 0.0 {
            return;
        }
        let mean_error = node.stats.sum_abs_error / node.stats.examples_seen;
        let NodeKind::Split {
            detector,
            alternate: None,
            ..
        } = &mut node.kind
        else {
            return;
        };
        if detector.test(normal_error - mean_error - drift.ph_alpha, drift.ph_threshold) {
            self.start_alternate(id);
        }
    }

    fn start_alternate(&mut self, id: NodeId) {
        let link = ParentLink {
            parent: id,
            slot: Slot::Alternate,
        };
        let model = LeafModel::new(&self.config);
        let root = self.arena.insert(Node::leaf(model, Some(link), false));
        if let NodeKind::Split { alternate, .. } = &mut self.arena[id].kind {
            *alternate = Some(Alternate {
                root,
                loss: Default::default(),
            });
        }
        self.set_change_detection(id, false);
        debug!(node = id.index(), alternate = root.index(), "change detected, growing alternate subtree");
    }

    /// Score the alternate subtree of `id` against the original, and
    /// promote, discard or train it. Returns the promoted root.
    fn evaluate_alternate(
        &mut self,
        id: NodeId,
        x: &FeatureVector,
        y: f64,
        weight: f64,
        prediction: f64,
        normal_error: f64,
    ) -> Option<NodeId> {
        let NodeKind::Split {
            alternate: Some(alternate),
            ..
        } = &self.arena[id].kind
        else {
            return None;
        };
        let alternate_root = alternate.root;
        let loss_original = (y - prediction).powi(2);
        let loss_alternate = (y - self.predict_from(alternate_root, x)).powi(2);
        let grace_period = self.config.grace_period;
        let verdict = match &mut self.arena[id].kind {
            NodeKind::Split {
                alternate: Some(alternate),
                ..
            } => alternate.loss.record(
                loss_original,
                loss_alternate,
                weight,
                grace_period,
                &self.config.drift,
            ),
            _ => AlternateVerdict::Keep,
        };
        match verdict {
            AlternateVerdict::Promote => Some(self.promote_alternate(id)),
            AlternateVerdict::Discard => {
                self.discard_alternate(id);
                None
            }
            AlternateVerdict::Keep => {
                self.process_instance(alternate_root, x, y, weight, prediction, normal_error, true);
                None
            }
        }
    }

    fn take_alternate(&mut self, id: NodeId) -> Option<Alternate> {
        match &mut self.arena[id].kind {
            NodeKind::Split { alternate, .. } => alternate.take(),
            _ => None,
        }
    }

    fn promote_alternate(&mut self, id: NodeId) -> NodeId {
        let Some(alternate) = self.take_alternate(id) else {
            return id;
        };
        let replacement = alternate.root;
        let parent = self.arena[id].parent;
        self.arena[replacement].parent = parent;
        match parent {
            None => self.root = replacement,
            Some(link) => self.replace_child(link, replacement),
        }
        self.remove_subtree(id);
        if self.growth_allowed {
            self.restart_change_detection(replacement);
        }
        self.recount_leaves();
        debug!(node = id.index(), replacement = replacement.index(), "promoted alternate subtree");
        replacement
    }

    fn discard_alternate(&mut self, id: NodeId) {
        let Some(alternate) = self.take_alternate(id) else {
            return;
        };
        self.remove_subtree(alternate.root);
        if self.growth_allowed {
            self.restart_change_detection(id);
        }
        debug!(node = id.index(), "discarded alternate subtree");
    }

    fn replace_child(&mut self, link: ParentLink, replacement: NodeId) {
        if let NodeKind::Split {
            children, alternate, ..
        } = &mut self.arena[link.parent].kind
        {
            match link.slot {
                Slot::Child(branch) => children[branch] = replacement,
                Slot::Alternate => {
                    if let Some(alternate) = alternate {
                        alternate.root = replacement;
                    }
                }
            }
        }
    }

    fn subtree_ids(&self, id: NodeId, include_alternates: bool) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            found.push(current);
            if let NodeKind::Split {
                children,
                alternate,
                ..
            } = &self.arena[current].kind
            {
                stack.extend(children.iter().rev());
                if include_alternates {
                    stack.extend(alternate.as_ref().map(|a| a.root));
                }
            }
        }
        found
    }

    fn remove_subtree(&mut self, id: NodeId) {
        for node in self.subtree_ids(id, true) {
            self.arena.remove(node);
        }
    }

    fn set_change_detection(&mut self, id: NodeId, enabled: bool) {
        for node in self.subtree_ids(id, false) {
            self.arena[node].change_detection = enabled;
        }
    }

    /// Re-enable change detection below `id`, skipping subtrees that are
    /// still evaluating an alternate.
    fn restart_change_detection(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &mut self.arena[current];
            match &mut node.kind {
                NodeKind::Split {
                    alternate: Some(_), ..
                } => {}
                NodeKind::Split {
                    children, detector, ..
                } => {
                    node.change_detection = true;
                    detector.reset();
                    stack.extend(children.iter());
                }
                _ => node.change_detection = true,
            }
        }
    }

    pub(crate) fn recount_leaves(&mut self) {
        let (mut active, mut inactive, mut splits) = (0, 0, 0);
        for id in self.subtree_ids(self.root, false) {
            match self.arena[id].kind {
                NodeKind::ActiveLeaf(_) => active += 1,
                NodeKind::InactiveLeaf(_) => inactive += 1,
                NodeKind::Split { .. } => splits += 1,
            }
        }
        self.active_leaf_count = active;
        self.inactive_leaf_count = inactive;
        self.split_node_count = splits;
    }

    /// Leaves of the main tree, left to right.
    pub fn leaves(&self) -> Vec<LeafSummary> {
        let mut leaves = Vec::new();
        let mut stack = vec![(self.root, 0)];
        while let Some((id, depth)) = stack.pop() {
            let node = &self.arena[id];
            match &node.kind {
                NodeKind::Split { children, .. } => {
                    stack.extend(children.iter().rev().map(|&child| (child, depth + 1)));
                }
                _ => leaves.push(LeafSummary {
                    id,
                    active: node.is_active_leaf(),
                    depth,
                    stats: node.stats,
                }),
            }
        }
        leaves
    }

    /// Number of split levels on the longest path; 0 for a single leaf.
    pub fn depth(&self) -> usize {
        self.leaves().iter().map(|leaf| leaf.depth).max().unwrap_or(0)
    }

    pub fn measurements(&self) -> TreeMeasurements {
        TreeMeasurements {
            node_count: self.node_count(),
            leaf_count: self.leaf_count(),
            active_leaf_count: self.active_leaf_count,
            inactive_leaf_count: self.inactive_leaf_count,
            split_node_count: self.split_node_count,
            depth: self.depth(),
            active_leaf_byte_estimate: self.active_leaf_byte_estimate,
            inactive_leaf_byte_estimate: self.inactive_leaf_byte_estimate,
            overhead_fraction: self.overhead_fraction,
            leaf_byte_estimate: self.leaf_byte_estimate(),
            byte_size: self.byte_size(),
            histogram_byte_size: self.histogram_byte_size(),
        }
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>, id: NodeId, indent: usize) -> fmt::Result {
        let node = &self.arena[id];
        match &node.kind {
            NodeKind::Split { test, children, .. } => {
                writeln!(f, "{:indent$}if {test}:", "")?;
                self.describe(f, children[0], indent + 2)?;
                writeln!(f, "{:indent$}else:", "")?;
                self.describe(f, children[1], indent + 2)
            }
            kind => {
                let state = if matches!(kind, NodeKind::ActiveLeaf(_)) {
                    "leaf"
                } else {
                    "inactive leaf"
                };
                match node.leaf_model() {
                    Some(model) if self.config.build_linear_leaf_model => {
                        writeln!(f, "{:indent$}{state}: {}", "", model.perceptron)
                    }
                    _ => writeln!(f, "{:indent$}{state}: y = {:.4}", "", self.mean_prediction(id)),
                }
            }
        }
    }
}

impl fmt::Display for FimtTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(f, self.root, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_stream(tree: &mut FimtTree, n: u32) {
        for i in 0..n {
            let x = f64::from((i * 37) % 101) / 101.0;
            let y = if x <= 0.5 { 0.0 } else { 10.0 };
            tree.train(&[x, 0.3], y, 1.0).unwrap();
        }
    }

    #[test]
    fn fresh_tree_is_one_active_leaf() {
        let tree = FimtTree::new(TreeConfig::default()).unwrap();
        assert_eq!(tree.active_leaf_count(), 1);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.split_node_count(), 0);
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.predict(&[1.0, 2.0]), 0.0);
        assert!(tree.predict_histogram(&[1.0]).is_none());
    }

    #[test]
    fn rejects_invalid_configuration() {
        let err = FimtTree::new(TreeConfig::default().with_split_confidence(1.0)).unwrap_err();
        assert!(matches!(err, FimtError::InvalidConfig { .. }));
    }

    #[test]
    fn splits_on_a_step_and_describes_itself() {
        let config = TreeConfig::default()
            .regression_tree()
            .with_grace_period(20)
            .with_split_confidence(0.01);
        let mut tree = FimtTree::new(config).unwrap();
        step_stream(&mut tree, 400);
        assert!(tree.split_node_count() >= 1);
        let NodeKind::Split { test, .. } = &tree.node(tree.root()).unwrap().kind else {
            panic!("root did not split");
        };
        assert_eq!(test.feature, 0);
        let description = tree.to_string();
        assert!(description.starts_with("if x[0] <= "), "{description}");
        assert!(description.contains("else:"));
    }

    #[test]
    fn counts_match_the_leaves_reachable_from_root() {
        let config = TreeConfig::default()
            .with_grace_period(10)
            .with_split_confidence(0.05);
        let mut tree = FimtTree::new(config).unwrap();
        step_stream(&mut tree, 600);
        let leaves = tree.leaves();
        assert_eq!(leaves.len(), tree.leaf_count());
        assert_eq!(
            leaves.iter().filter(|leaf| leaf.active).count(),
            tree.active_leaf_count()
        );
        assert_eq!(tree.node_count(), 2 * tree.split_node_count() + 1);
    }

    #[test]
    fn zero_weight_examples_are_ignored() {
        let mut tree = FimtTree::new(TreeConfig::default()).unwrap();
        tree.train(&[1.0], 5.0, 0.0).unwrap();
        assert_eq!(tree.global_stats().instances_seen(), 0);
        assert_eq!(tree.node(tree.root()).unwrap().stats.examples_seen, 0.0);
    }
}
