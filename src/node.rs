//! Tree nodes and the arena that owns them.
//!
//! Nodes are addressed by [`NodeId`] and link to their parent by index, so
//! replacing a subtree is a single rewrite of the parent's child slot.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::ops::{Index, IndexMut};

use rand::Rng;
use rand::seq::index::sample;

use crate::config::{FeatureSubspace, TreeConfig};
use crate::criterion::{SplitCriterion, SplitSuggestion, SplitTest, TargetStats};
use crate::drift::{AlternateLoss, PageHinckley};
use crate::histogram::{Histogram, MergeableHistogram};
use crate::observer::AttributeSplitObserver;
use crate::perceptron::Perceptron;
use crate::stats::GlobalStats;

/// Index of a node in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Where a node hangs below its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Child(usize),
    Alternate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    pub parent: NodeId,
    pub slot: Slot,
}

/// Running statistics every node keeps about the examples routed through it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeStats {
    pub examples_seen: f64,
    pub sum_target: f64,
    pub sum_target_sq: f64,
    /// Cumulative normalized absolute error, the node's promise.
    pub sum_abs_error: f64,
}

impl NodeStats {
    pub fn add(&mut self, y: f64, weight: f64, abs_error: f64) {
        self.examples_seen += weight;
        self.sum_target += weight * y;
        self.sum_target_sq += weight * y * y;
        self.sum_abs_error += weight * abs_error;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.examples_seen > 0.0).then(|| self.sum_target / self.examples_seen)
    }

    pub fn target_stats(&self) -> TargetStats {
        TargetStats {
            weight: self.examples_seen,
            sum: self.sum_target,
            sum_sq: self.sum_target_sq,
        }
    }

    pub fn promise(&self) -> f64 {
        self.sum_abs_error
    }
}

/// Predictor state a leaf keeps whether active or not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeafModel {
    pub perceptron: Perceptron,
    pub label_histogram: Option<Histogram>,
}

impl LeafModel {
    pub fn new(config: &TreeConfig) -> Self {
        Self {
            perceptron: Perceptron::new(),
            label_histogram: Self::fresh_histogram(config),
        }
    }

    fn fresh_histogram(config: &TreeConfig) -> Option<Histogram> {
        config
            .quantile_leaf_bins
            .map(|bins| config.histogram_kind.build(bins))
    }

    /// Model of a new child: the parent's perceptron weights and an empty label histogram.
    pub fn for_child(&self, config: &TreeConfig) -> Self {
        Self {
            perceptron: self.perceptron.child_copy(),
            label_histogram: Self::fresh_histogram(config),
        }
    }

    pub fn learn<R: Rng + ?Sized>(
        &mut self,
        x: &[f64],
        y: f64,
        weight: f64,
        stats: &GlobalStats,
        config: &TreeConfig,
        rng: &mut R,
    ) {
        if config.build_linear_leaf_model {
            self.perceptron.update(x, y, weight, stats, config, rng);
        }
        if let Some(histogram) = &mut self.label_histogram {
            histogram.insert_weighted(y, weight.round() as u64);
        }
    }

    pub fn byte_size(&self) -> usize {
        self.perceptron.byte_size()
            + self
                .label_histogram
                .as_ref()
                .map_or(0, |h| h.byte_size().saturating_sub(size_of::<Histogram>()))
    }
}

/// A leaf that collects split candidates.
#[derive(Debug, Clone)]
pub struct ActiveLeaf {
    pub model: LeafModel,
    pub observers: BTreeMap<usize, AttributeSplitObserver>,
    pub examples_seen_at_last_split_eval: f64,
    /// Features this leaf observes; `None` until sampled (or for all features).
    pub subspace: Option<Vec<usize>>,
}

impl ActiveLeaf {
    pub fn new(model: LeafModel, examples_seen: f64) -> Self {
        Self {
            model,
            observers: BTreeMap::new(),
            examples_seen_at_last_split_eval: examples_seen,
            subspace: None,
        }
    }

    /// Feed the example's feature values to this leaf's observers.
    pub fn observe<R: Rng + ?Sized>(
        &mut self,
        x: &[f64],
        y: f64,
        weight: f64,
        stats: &GlobalStats,
        config: &TreeConfig,
        rng: &mut R,
    ) {
        if self.subspace.is_none() && config.feature_subspace != FeatureSubspace::All {
            let k = config.feature_subspace.size(x.len());
            let mut features = sample(rng, x.len(), k).into_vec();
            features.sort_unstable();
            self.subspace = Some(features);
        }
        let normalized_target = stats.normalize_target(y);
        let features: Vec<usize> = match &self.subspace {
            Some(features) => features.clone(),
            None => (0..x.len()).collect(),
        };
        for feature in features {
            let observer = self.observers.entry(feature).or_insert_with(|| {
                AttributeSplitObserver::new(
                    config.histogram_kind,
                    config.observer_bins,
                    config.target_buckets,
                )
            });
            observer.observe(x[feature], y, normalized_target, weight);
        }
    }

    /// Best suggestion of every observed feature, in feature order.
    pub fn best_split_suggestions(
        &self,
        criterion: &dyn SplitCriterion,
        pre_split: &TargetStats,
        num_candidates: usize,
    ) -> Vec<SplitSuggestion> {
        self.observers
            .iter()
            .filter_map(|(&feature, observer)| {
                observer.best_split_suggestion(criterion, pre_split, feature, num_candidates)
            })
            .collect()
    }

    fn byte_size(&self) -> usize {
        self.model.byte_size()
            + self
                .observers
                .values()
                .map(|observer| size_of::<usize>() + observer.byte_size())
                .sum::<usize>()
            + self
                .subspace
                .as_ref()
                .map_or(0, |features| features.capacity() * size_of::<usize>())
    }
}

/// Alternate subtree grown below a split node after a detected change.
#[derive(Debug, Clone, PartialEq)]
pub struct Alternate {
    pub root: NodeId,
    pub loss: AlternateLoss,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    ActiveLeaf(ActiveLeaf),
    /// A leaf frozen with respect to splitting; its model keeps learning.
    InactiveLeaf(LeafModel),
    Split {
        test: SplitTest,
        children: [NodeId; 2],
        detector: PageHinckley,
        alternate: Option<Alternate>,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub stats: NodeStats,
    pub parent: Option<ParentLink>,
    pub change_detection: bool,
    pub kind: NodeKind,
}

impl Node {
    pub fn leaf(model: LeafModel, parent: Option<ParentLink>, change_detection: bool) -> Self {
        Self {
            stats: NodeStats::default(),
            parent,
            change_detection,
            kind: NodeKind::ActiveLeaf(ActiveLeaf::new(model, 0.0)),
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self.kind, NodeKind::Split { .. })
    }

    pub fn is_active_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::ActiveLeaf(_))
    }

    /// Freeze an active leaf, dropping its observers. False if not an active leaf.
    pub fn deactivate(&mut self) -> bool {
        let NodeKind::ActiveLeaf(leaf) = &mut self.kind else {
            return false;
        };
        let model = std::mem::take(&mut leaf.model);
        self.kind = NodeKind::InactiveLeaf(model);
        true
    }

    /// Turn an inactive leaf back into an active one with empty observers.
    pub fn activate(&mut self) -> bool {
        let NodeKind::InactiveLeaf(model) = &mut self.kind else {
            return false;
        };
        let model = std::mem::take(model);
        self.kind = NodeKind::ActiveLeaf(ActiveLeaf::new(model, self.stats.examples_seen));
        true
    }

    pub fn leaf_model(&self) -> Option<&LeafModel> {
        match &self.kind {
            NodeKind::ActiveLeaf(leaf) => Some(&leaf.model),
            NodeKind::InactiveLeaf(model) => Some(model),
            NodeKind::Split { .. } => None,
        }
    }

    /// Approximate size of this node alone, without its subtree.
    pub fn byte_size(&self) -> usize {
        size_of::<Self>()
            + match &self.kind {
                NodeKind::ActiveLeaf(leaf) => leaf.byte_size(),
                NodeKind::InactiveLeaf(model) => model.byte_size(),
                NodeKind::Split { .. } => 0,
            }
    }
}

/// Slab of nodes with slot reuse.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
}

impl Arena {
    pub fn insert(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                NodeId(index)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)?.as_ref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| node.as_ref().map(|node| (NodeId(i), node)))
    }

    pub fn byte_size(&self) -> usize {
        size_of::<Self>()
            + self.nodes.capacity() * size_of::<Option<Node>>()
            + self.free.capacity() * size_of::<usize>()
    }
}

impl Index<NodeId> for Arena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        self.nodes[id.0].as_ref().expect("node id refers to a removed node")
    }
}

impl IndexMut<NodeId> for Arena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0].as_mut().expect("node id refers to a removed node")
    }
}
