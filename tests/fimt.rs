use approx::assert_abs_diff_eq;
use fimt_trees::{FeatureSubspace, FimtError, FimtTree, NodeKind, TreeConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn learns_threshold_of_perfectly_correlated_feature() {
    let config = TreeConfig::default()
        .regression_tree()
        .with_grace_period(1)
        .with_split_confidence(0.1);
    let mut tree = FimtTree::new(config).unwrap();

    for i in 0..50u32 {
        let x = f64::from((i * 37) % 50) / 50.0;
        tree.train(&[x], x, 1.0).unwrap();
    }
    assert!(tree.split_node_count() >= 1, "tree never split");

    let NodeKind::Split { test, .. } = &tree.node(tree.root()).unwrap().kind else {
        panic!("root is still a leaf");
    };
    let t = test.threshold;
    assert!(t > 0.0 && t < 1.0, "threshold {t} outside the observed range");

    let (left_mean, right_mean) = (t / 2.0, (1.0 + t) / 2.0);
    let left = tree.predict(&[0.01]);
    let right = tree.predict(&[0.99]);
    assert!(
        (left - left_mean).abs() < (left - right_mean).abs(),
        "left prediction {left} not closer to {left_mean} than {right_mean}"
    );
    assert!(
        (right - right_mean).abs() < (right - left_mean).abs(),
        "right prediction {right} not closer to {right_mean} than {left_mean}"
    );
}

#[test]
fn each_split_adds_one_split_node_and_one_active_leaf() {
    let config = TreeConfig::default()
        .with_grace_period(25)
        .with_split_confidence(0.01)
        .with_memory_management(false);
    let mut tree = FimtTree::new(config).unwrap();
    let mut rng = StdRng::seed_from_u64(11);

    let mut splits_seen = 0;
    for _ in 0..4000 {
        let x: [f64; 2] = [rng.random_range(0.0..1.0), rng.random_range(0.0..1.0)];
        let y = (x[0] * 4.0).floor() + if x[1] > 0.7 { 3.0 } else { 0.0 };
        let (splits, active) = (tree.split_node_count(), tree.active_leaf_count());
        tree.train(&x, y, 1.0).unwrap();
        if tree.split_node_count() != splits {
            assert_eq!(tree.split_node_count(), splits + 1);
            assert_eq!(tree.active_leaf_count(), active + 1);
            splits_seen += 1;
        }
    }
    assert!(splits_seen >= 2, "only {splits_seen} splits");
}

#[test]
fn leaf_counts_hold_with_interleaved_memory_passes() {
    let config = TreeConfig::default()
        .with_grace_period(20)
        .with_split_confidence(0.01)
        .with_max_bytes(40_000)
        .with_memory_estimate_period(150);
    let mut tree = FimtTree::new(config).unwrap();
    let mut rng = StdRng::seed_from_u64(5);

    for i in 0..6000 {
        let x: [f64; 2] = [rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)];
        let y = x[0].sin() * 3.0 + x[1].abs() + rng.random_range(-0.1..0.1);
        tree.train(&x, y, 1.0).unwrap();
        if i % 97 == 0 {
            tree.estimate_model_byte_sizes();
        }
        let leaves = tree.leaves();
        assert_eq!(leaves.len(), tree.leaf_count());
        assert_eq!(
            leaves.iter().filter(|leaf| leaf.active).count(),
            tree.active_leaf_count()
        );
    }
    let m = tree.measurements();
    assert_eq!(m.node_count, m.leaf_count + m.split_node_count);
    assert!(m.active_leaf_count >= 1);
}

#[test]
fn model_tree_fits_a_line() {
    let mut tree = FimtTree::new(TreeConfig::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..5000 {
        let x = rng.random_range(0.0..1.0);
        tree.train(&[x], 3.0 * x + 1.0, 1.0).unwrap();
    }
    assert_abs_diff_eq!(tree.predict(&[0.5]), 2.5, epsilon = 0.5);
    assert!(tree.to_string().contains("* norm(x[0])"));
}

#[test]
fn non_finite_targets_are_rejected() {
    let mut tree = FimtTree::new(TreeConfig::default()).unwrap();
    for y in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        assert!(matches!(
            tree.train(&[1.0], y, 1.0),
            Err(FimtError::NonFiniteTarget(_))
        ));
    }
    assert_eq!(tree.global_stats().instances_seen(), 0);
}

#[test]
fn infinite_target_leaves_a_trained_tree_untouched() {
    let mut tree = FimtTree::new(TreeConfig::default().with_grace_period(20)).unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    for _ in 0..300 {
        let x = rng.random_range(0.0..1.0);
        tree.train(&[x], 2.0 * x, 1.0).unwrap();
    }
    let before = tree.predict(&[0.4]);
    assert_eq!(
        tree.train(&[0.4], f64::INFINITY, 1.0),
        Err(FimtError::NonFiniteTarget(f64::INFINITY))
    );
    assert_eq!(tree.global_stats().instances_seen(), 300);
    assert!(tree.global_stats().target().mean().is_finite());
    assert_eq!(tree.predict(&[0.4]), before);
}

#[test]
fn invalid_weights_are_rejected() {
    let mut tree = FimtTree::new(TreeConfig::default()).unwrap();
    assert_eq!(
        tree.train(&[1.0], 1.0, -1.0),
        Err(FimtError::InvalidWeight(-1.0))
    );
    assert!(matches!(
        tree.train(&[1.0], 1.0, f64::INFINITY),
        Err(FimtError::InvalidWeight(_))
    ));
}

#[test]
fn dimension_is_fixed_by_first_instance() {
    let mut tree = FimtTree::new(TreeConfig::default()).unwrap();
    tree.train(&[1.0, 2.0], 4.0, 1.0).unwrap();
    tree.train(&[2.0, 2.0], 6.0, 1.0).unwrap();
    assert_eq!(
        tree.train(&[1.0], 1.0, 1.0),
        Err(FimtError::DimensionMismatch {
            expected: 2,
            got: 1
        })
    );
    assert_abs_diff_eq!(tree.predict(&[1.0, 2.0, 3.0]), 5.0);
}

#[test]
fn nan_features_are_tolerated() {
    let config = TreeConfig::default()
        .regression_tree()
        .with_grace_period(10)
        .with_split_confidence(0.05);
    let mut tree = FimtTree::new(config).unwrap();
    for i in 0..500u32 {
        let x0 = f64::from(i % 20);
        let x1 = if i % 3 == 0 { f64::NAN } else { f64::from(i % 7) };
        tree.train(&[x0, x1], x0 * 2.0, 1.0).unwrap();
    }
    assert!(tree.predict(&[f64::NAN, f64::NAN]).is_finite());
    assert!(tree.predict(&[3.0, f64::NAN]).is_finite());
}

#[test]
fn same_seed_same_model() {
    let build = || {
        let config = TreeConfig::default().with_grace_period(30).with_seed(99);
        let mut tree = FimtTree::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..3000 {
            let x = [rng.random_range(0.0..1.0), rng.random_range(0.0..1.0)];
            tree.train(&x, x[0] * x[1] * 10.0, 1.0).unwrap();
        }
        tree
    };
    let (a, b) = (build(), build());
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(a.predict(&[0.3, 0.8]), b.predict(&[0.3, 0.8]));
}

#[test]
fn weights_count_as_repeated_examples() {
    let config = TreeConfig::default().regression_tree();
    let mut tree = FimtTree::new(config).unwrap();
    tree.train(&[0.0], 1.0, 3.0).unwrap();
    tree.train(&[0.0], 5.0, 1.0).unwrap();
    let root = tree.node(tree.root()).unwrap();
    assert_eq!(root.stats.examples_seen, 4.0);
    assert_abs_diff_eq!(tree.predict(&[0.0]), 2.0);
    assert_abs_diff_eq!(tree.global_stats().weight_seen(), 4.0);
}

#[test]
fn leaves_observe_only_their_subspace() {
    let config = TreeConfig::default()
        .with_grace_period(50)
        .with_split_confidence(0.01)
        .with_feature_subspace(FeatureSubspace::Fixed(2));
    let mut tree = FimtTree::new(config).unwrap();
    let mut rng = StdRng::seed_from_u64(8);
    for _ in 0..3000 {
        let x: Vec<f64> = (0..5).map(|_| rng.random_range(0.0..1.0)).collect();
        let y = x.iter().sum::<f64>();
        tree.train(&x, y, 1.0).unwrap();
    }
    for leaf in tree.leaves() {
        if let NodeKind::ActiveLeaf(active) = &tree.node(leaf.id).unwrap().kind {
            assert!(active.observers.len() <= 2);
        }
    }
}

#[test]
fn infinite_features_keep_predictions_finite() {
    let config = TreeConfig::default().with_grace_period(20);
    let mut tree = FimtTree::new(config).unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    for i in 0..1000 {
        let x0 = rng.random_range(0.0..1.0);
        let x1 = match i % 10 {
            0 => f64::INFINITY,
            5 => f64::NEG_INFINITY,
            _ => rng.random_range(0.0..1.0),
        };
        tree.train(&[x0, x1], x0 + 1.0, 1.0).unwrap();
    }
    assert!(tree.global_stats().feature(1).unwrap().mean().is_finite());
    assert!(tree.predict(&[0.5, 0.5]).is_finite());
    assert!(tree.predict(&[0.5, f64::INFINITY]).is_finite());
}
