//! # Forest Estimation Backend
//!
//! Honest random forests in the generalized-random-forest tradition:
//! - every tree is grown on a subsample drawn without replacement, with the
//!   structure chosen on one half and leaf contents taken from the other;
//! - predictions are forest-weighted averages, where a training row's weight for
//!   a query point is its share of the leaf the query falls into, averaged over
//!   trees;
//! - in-sample predictions only use trees that did not draw the row (out-of-bag).
//!
//! Trees are grown in parallel with `rayon`. Each tree seeds its own RNG from
//! the forest seed and its index, so a fixed seed gives identical forests
//! regardless of thread scheduling.

pub mod causal;
pub mod inference;
pub mod params;
pub mod regression;
pub mod stats;
pub mod tree;
pub mod tune;

use ahash::AHashMap;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use ndarray::{ArrayView1, ArrayView2};
use ndarray_linalg::error::LinalgError;
use params::ForestParams;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::io::IsTerminal;
use thiserror::Error;
use tree::{GrowContext, SplitTargets, Tree};

/// Failures raised by the estimation backend.
#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("The treatment variable has no variation; treatment effects are not identified.")]
    NoTreatmentVariation,
    #[error(
        "The treatment must be a 0/1 indicator, but row {row} has the value {value}."
    )]
    NonBinaryTreatment { row: usize, value: f64 },
    #[error("Cannot fit a forest on an empty sample.")]
    EmptySample,
    #[error("Invalid forest parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error(
        "Too few rows ({rows}) to grow trees with sample fraction {sample_fraction}. Increase the sample or the fraction."
    )]
    TooFewRows { rows: usize, sample_fraction: f64 },
    #[error("Estimator inputs have inconsistent shapes: {0}")]
    Shape(String),
    #[error("Non-finite values were found in {0}.")]
    NonFinite(&'static str),
    #[error("The regression design is singular and cannot be inverted: {0}")]
    SingularDesign(#[from] LinalgError),
    #[error("The regression design is degenerate: {0}")]
    DegenerateDesign(String),
    #[error("Tree index {index} is out of range for a forest of {num_trees} trees.")]
    TreeIndex { index: usize, num_trees: usize },
    #[error("Reward matrix must have at least two arms, found {0}.")]
    TooFewArms(usize),
    #[error("Statistical distribution error: {0}")]
    Distribution(String),
}

/// Seed for tree `index` of a forest seeded with `seed`.
fn tree_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64)
        .wrapping_add(1)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} trees {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());
    pb
}

/// Grows `params.num_trees` trees over the rows of `x`.
pub(crate) fn grow_trees<T: SplitTargets>(
    x: ArrayView2<f64>,
    targets: &T,
    params: &ForestParams,
    label: &str,
    show_progress: bool,
) -> Result<Vec<Tree>, EstimatorError> {
    let n = x.nrows();
    if n == 0 {
        return Err(EstimatorError::EmptySample);
    }
    params.validate(n, x.ncols())?;
    let ctx = GrowContext {
        x: x.view(),
        params,
        mtry: params.resolved_mtry(x.ncols()),
    };

    let pb = if show_progress {
        create_progress_bar(params.num_trees as u64, label)
    } else {
        ProgressBar::hidden()
    };
    let trees: Vec<Tree> = (0..params.num_trees)
        .into_par_iter()
        .map(|index| {
            let mut rng = StdRng::seed_from_u64(tree_seed(params.seed, index));
            let tree = tree::grow(&ctx, targets, n, &mut rng);
            pb.inc(1);
            tree
        })
        .collect();
    pb.finish_and_clear();

    let leaves: usize = trees.iter().map(Tree::num_leaves).sum();
    debug!(
        "Grew {} trees for {label} (mean {:.1} leaves per tree)",
        trees.len(),
        leaves as f64 / trees.len() as f64
    );
    Ok(trees)
}

/// Unnormalised forest weights of the training rows for one query point.
///
/// When `exclude` names a training row, only trees that did not draw that row
/// contribute. Returns `None` when no tree contributed.
pub(crate) fn forest_weights(
    trees: &[Tree],
    point: ArrayView1<f64>,
    exclude: Option<usize>,
) -> Option<AHashMap<usize, f64>> {
    let mut weights: AHashMap<usize, f64> = AHashMap::new();
    let mut used = 0usize;
    for tree in trees {
        if exclude.is_some_and(|row| tree.is_in_bag(row)) {
            continue;
        }
        let leaf = tree.leaf_samples(point);
        if leaf.is_empty() {
            continue;
        }
        used += 1;
        let share = 1.0 / leaf.len() as f64;
        for &row in leaf {
            *weights.entry(row).or_insert(0.0) += share;
        }
    }
    (used > 0).then_some(weights)
}

/// Depth-weighted split frequencies, normalised to sum to one.
///
/// Splits at depth `d` (root = 1) are counted per variable for `d <= max_depth`,
/// each depth's counts are turned into shares, and the shares are combined with
/// weights `d^-decay`.
pub(crate) fn variable_importance(
    trees: &[Tree],
    num_features: usize,
    decay: f64,
    max_depth: usize,
) -> Vec<f64> {
    let mut counts = vec![vec![0.0f64; num_features]; max_depth];
    for tree in trees {
        tree.visit(|depth, node| {
            if let tree::Node::Split { variable, .. } = node {
                if depth < max_depth {
                    counts[depth][*variable] += 1.0;
                }
            }
        });
    }

    let weights: Vec<f64> = (1..=max_depth).map(|d| (d as f64).powf(-decay)).collect();
    let mut importance = vec![0.0; num_features];
    for (depth_counts, weight) in counts.iter().zip(&weights) {
        let row_total: f64 = depth_counts.iter().sum::<f64>().max(1.0);
        for (slot, count) in importance.iter_mut().zip(depth_counts) {
            *slot += weight * count / row_total;
        }
    }
    let total: f64 = importance.iter().sum();
    if total > 0.0 {
        importance.iter_mut().for_each(|v| *v /= total);
    }
    importance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_seeds_differ_between_trees() {
        assert_ne!(tree_seed(42, 0), tree_seed(42, 1));
        assert_eq!(tree_seed(42, 5), tree_seed(42, 5));
    }
}
