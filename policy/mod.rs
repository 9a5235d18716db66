//! # Policy Trees
//!
//! Shallow decision trees that assign each row to the treatment arm with the
//! highest doubly robust reward. The tree is found by exhaustive search over
//! every split of every variable down to a fixed depth, so the result is the
//! exact optimum among trees of that depth (up to the `split_step` thinning of
//! candidate thresholds).
//!
//! Splits send `x_j <= threshold` to the left child.

use crate::forest::EstimatorError;
use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt::Write as FmtWrite;

const TIE_TOLERANCE: f64 = 1e-10;

/// Deepest tree the exhaustive search accepts. Its cost grows as `(n p)^depth`.
pub const MAX_POLICY_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicyNode {
    Split {
        variable: usize,
        threshold: f64,
        left: Box<PolicyNode>,
        right: Box<PolicyNode>,
    },
    Leaf {
        action: usize,
        samples: usize,
    },
}

/// A leaf of a fitted policy tree, in left-to-right order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyLeaf {
    pub action: usize,
    pub samples: usize,
    pub depth: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyTree {
    root: PolicyNode,
    depth: usize,
    num_features: usize,
    total_reward: f64,
}

struct Solution {
    reward: f64,
    node: PolicyNode,
}

struct Search<'a> {
    x: ArrayView2<'a, f64>,
    rewards: ArrayView2<'a, f64>,
    /// Row indices sorted by each variable.
    order: Vec<Vec<usize>>,
    split_step: usize,
}

impl Search<'_> {
    fn leaf(&self, rows: &[usize]) -> Solution {
        let totals = self.arm_totals(rows);
        let (action, reward) = best_arm(&totals);
        Solution {
            reward,
            node: PolicyNode::Leaf {
                action,
                samples: rows.len(),
            },
        }
    }

    fn arm_totals(&self, rows: &[usize]) -> Vec<f64> {
        let mut totals = vec![0.0; self.rewards.ncols()];
        for &row in rows {
            for (total, reward) in totals.iter_mut().zip(self.rewards.row(row)) {
                *total += reward;
            }
        }
        totals
    }

    /// `rows` sorted by `variable`, reusing the global ordering.
    fn sorted(&self, rows: &[usize], variable: usize) -> Vec<usize> {
        let mut member = vec![false; self.x.nrows()];
        for &row in rows {
            member[row] = true;
        }
        self.order[variable]
            .iter()
            .copied()
            .filter(|&row| member[row])
            .collect()
    }

    /// Split positions `k` (left child = `sorted[..k]`) between distinct values,
    /// keeping every `split_step`-th one.
    fn boundaries(&self, sorted: &[usize], variable: usize) -> Vec<usize> {
        let column = self.x.column(variable);
        (1..sorted.len())
            .filter(|&k| column[sorted[k - 1]] < column[sorted[k]])
            .enumerate()
            .filter(|(index, _)| index % self.split_step == 0)
            .map(|(_, k)| k)
            .collect()
    }

    fn solve(&self, rows: &[usize], depth: usize) -> Solution {
        let mut best = self.leaf(rows);
        if depth == 0 || rows.len() < 2 {
            return best;
        }
        for variable in 0..self.x.ncols() {
            if let Some(candidate) = self.best_split_on(rows, variable, depth) {
                if candidate.reward > best.reward + TIE_TOLERANCE {
                    best = candidate;
                }
            }
        }
        best
    }

    fn best_split_on(&self, rows: &[usize], variable: usize, depth: usize) -> Option<Solution> {
        let sorted = self.sorted(rows, variable);
        let boundaries = self.boundaries(&sorted, variable);
        if depth == 1 {
            self.best_stump(&sorted, &boundaries, variable)
        } else {
            let mut best: Option<Solution> = None;
            for k in boundaries {
                let left = self.solve(&sorted[..k], depth - 1);
                let right = self.solve(&sorted[k..], depth - 1);
                let reward = left.reward + right.reward;
                if best
                    .as_ref()
                    .is_none_or(|b| reward > b.reward + TIE_TOLERANCE)
                {
                    best = Some(Solution {
                        reward,
                        node: PolicyNode::Split {
                            variable,
                            threshold: self.x[[sorted[k - 1], variable]],
                            left: Box::new(left.node),
                            right: Box::new(right.node),
                        },
                    });
                }
            }
            best
        }
    }

    /// Depth-one search with running per-arm sums.
    fn best_stump(&self, sorted: &[usize], boundaries: &[usize], variable: usize) -> Option<Solution> {
        let totals = self.arm_totals(sorted);
        let mut left = vec![0.0; totals.len()];
        let mut consumed = 0usize;
        let mut best: Option<(f64, usize, usize, usize)> = None;
        for &k in boundaries {
            while consumed < k {
                for (sum, reward) in left.iter_mut().zip(self.rewards.row(sorted[consumed])) {
                    *sum += reward;
                }
                consumed += 1;
            }
            let right: Vec<f64> = totals.iter().zip(&left).map(|(t, l)| t - l).collect();
            let (left_action, left_reward) = best_arm(&left);
            let (right_action, right_reward) = best_arm(&right);
            let reward = left_reward + right_reward;
            if best.is_none_or(|(b, ..)| reward > b + TIE_TOLERANCE) {
                best = Some((reward, k, left_action, right_action));
            }
        }
        best.map(|(reward, k, left_action, right_action)| Solution {
            reward,
            node: PolicyNode::Split {
                variable,
                threshold: self.x[[sorted[k - 1], variable]],
                left: Box::new(PolicyNode::Leaf {
                    action: left_action,
                    samples: k,
                }),
                right: Box::new(PolicyNode::Leaf {
                    action: right_action,
                    samples: sorted.len() - k,
                }),
            },
        })
    }
}

/// Arm with the largest total; the lowest index wins ties.
fn best_arm(totals: &[f64]) -> (usize, f64) {
    let mut best = (0, totals[0]);
    for (action, &total) in totals.iter().enumerate().skip(1) {
        if total > best.1 + TIE_TOLERANCE {
            best = (action, total);
        }
    }
    best
}

impl PolicyTree {
    /// Finds the depth-`depth` tree maximising the summed reward of the
    /// recommended arm. `rewards[[i, a]]` is row `i`'s reward under arm `a`.
    pub fn fit(
        x: ArrayView2<f64>,
        rewards: ArrayView2<f64>,
        depth: usize,
        split_step: usize,
    ) -> Result<Self, EstimatorError> {
        let (n, p) = x.dim();
        if n == 0 {
            return Err(EstimatorError::EmptySample);
        }
        if rewards.nrows() != n {
            return Err(EstimatorError::Shape(format!(
                "X has {n} rows but the reward matrix has {}",
                rewards.nrows()
            )));
        }
        if rewards.ncols() < 2 {
            return Err(EstimatorError::TooFewArms(rewards.ncols()));
        }
        if depth > MAX_POLICY_DEPTH {
            return Err(EstimatorError::InvalidParameter {
                name: "depth",
                reason: format!("must be at most {MAX_POLICY_DEPTH}, got {depth}"),
            });
        }
        if split_step == 0 {
            return Err(EstimatorError::InvalidParameter {
                name: "split_step",
                reason: "must be at least 1".to_string(),
            });
        }
        if x.iter().chain(rewards.iter()).any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("the policy tree inputs"));
        }

        let order = (0..p)
            .map(|variable| {
                let column = x.column(variable);
                let mut rows: Vec<usize> = (0..n).collect();
                rows.sort_by(|&a, &b| column[a].total_cmp(&column[b]));
                rows
            })
            .collect();
        let search = Search {
            x: x.view(),
            rewards: rewards.view(),
            order,
            split_step,
        };
        let rows: Vec<usize> = (0..n).collect();

        // The root's variables are searched in parallel, then reduced in
        // variable order so ties resolve exactly as in the serial search.
        let mut best = search.leaf(&rows);
        if depth > 0 && n > 1 {
            let per_variable: Vec<Option<Solution>> = (0..p)
                .into_par_iter()
                .map(|variable| search.best_split_on(&rows, variable, depth))
                .collect();
            for candidate in per_variable.into_iter().flatten() {
                if candidate.reward > best.reward + TIE_TOLERANCE {
                    best = candidate;
                }
            }
        }

        Ok(Self {
            root: best.node,
            depth,
            num_features: p,
            total_reward: best.reward,
        })
    }

    pub fn root(&self) -> &PolicyNode {
        &self.root
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Summed reward of the recommended arms over the training rows.
    pub fn total_reward(&self) -> f64 {
        self.total_reward
    }

    /// Recommended arm for one row.
    pub fn action(&self, point: ArrayView1<f64>) -> usize {
        let mut node = &self.root;
        loop {
            match node {
                PolicyNode::Split {
                    variable,
                    threshold,
                    left,
                    right,
                } => {
                    node = if point[*variable] <= *threshold {
                        left
                    } else {
                        right
                    };
                }
                PolicyNode::Leaf { action, .. } => return *action,
            }
        }
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<usize>, EstimatorError> {
        if x.ncols() != self.num_features {
            return Err(EstimatorError::Shape(format!(
                "the policy tree was fit on {} covariates but {} were supplied",
                self.num_features,
                x.ncols()
            )));
        }
        Ok(x.outer_iter().map(|row| self.action(row)).collect())
    }

    pub fn leaves(&self) -> Vec<PolicyLeaf> {
        fn walk(node: &PolicyNode, depth: usize, out: &mut Vec<PolicyLeaf>) {
            match node {
                PolicyNode::Split { left, right, .. } => {
                    walk(left, depth + 1, out);
                    walk(right, depth + 1, out);
                }
                PolicyNode::Leaf { action, samples } => out.push(PolicyLeaf {
                    action: *action,
                    samples: *samples,
                    depth,
                }),
            }
        }
        let mut out = Vec::new();
        walk(&self.root, 0, &mut out);
        out
    }

    /// Indented text rendering, using `names` for variables and `arms` for actions.
    pub fn describe(&self, names: &[String], arms: &[&str]) -> String {
        fn walk(node: &PolicyNode, depth: usize, names: &[String], arms: &[&str], out: &mut String) {
            let indent = "  ".repeat(depth);
            match node {
                PolicyNode::Split {
                    variable,
                    threshold,
                    left,
                    right,
                } => {
                    let name = variable_label(names, *variable);
                    let _ = writeln!(out, "{indent}split on {name} <= {threshold:.4}");
                    walk(left, depth + 1, names, arms, out);
                    let _ = writeln!(out, "{indent}split on {name} > {threshold:.4}");
                    walk(right, depth + 1, names, arms, out);
                }
                PolicyNode::Leaf { action, samples } => {
                    let _ = writeln!(
                        out,
                        "{indent}* action = {} ({samples} rows)",
                        action_label(arms, *action)
                    );
                }
            }
        }
        let mut out = format!("policy tree of depth {}\n", self.depth);
        walk(&self.root, 0, names, arms, &mut out);
        out
    }
}

pub fn variable_label(names: &[String], variable: usize) -> String {
    names
        .get(variable)
        .cloned()
        .unwrap_or_else(|| format!("X{}", variable + 1))
}

pub fn action_label(arms: &[&str], action: usize) -> String {
    arms.get(action)
        .map(|s| s.to_string())
        .unwrap_or_else(|| (action + 1).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    #[test]
    fn single_split_separates_the_arms() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let rewards = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let tree = PolicyTree::fit(x.view(), rewards.view(), 1, 1).unwrap();
        match tree.root() {
            PolicyNode::Split {
                variable,
                threshold,
                ..
            } => {
                assert_eq!(*variable, 0);
                assert_eq!(*threshold, 1.0);
            }
            PolicyNode::Leaf { .. } => panic!("expected a split"),
        }
        assert_eq!(tree.predict(x.view()).unwrap(), vec![0, 0, 1, 1]);
        assert_eq!(tree.total_reward(), 4.0);
    }

    #[test]
    fn depth_two_finds_an_interaction() {
        // Arm 1 is best only when both covariates are high.
        let x = Array2::from_shape_fn((40, 2), |(i, j)| if j == 0 { (i % 2) as f64 } else { (i / 20) as f64 });
        let rewards = Array2::from_shape_fn((40, 2), |(i, a)| {
            let both = i % 2 == 1 && i >= 20;
            match (both, a) {
                (true, 1) | (false, 0) => 1.0,
                _ => 0.0,
            }
        });
        let tree = PolicyTree::fit(x.view(), rewards.view(), 2, 1).unwrap();
        assert_eq!(tree.total_reward(), 40.0);
        let leaves = tree.leaves();
        assert!(leaves.len() <= 4);
        assert!(leaves.iter().all(|leaf| leaf.action < 2));
        assert_eq!(leaves.iter().map(|l| l.samples).sum::<usize>(), 40);
    }

    #[test]
    fn flat_rewards_give_a_single_leaf_on_the_first_arm() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [2.0, 2.0]];
        let rewards = Array2::<f64>::ones((3, 2));
        let tree = PolicyTree::fit(x.view(), rewards.view(), 2, 1).unwrap();
        assert_eq!(tree.leaves(), vec![PolicyLeaf { action: 0, samples: 3, depth: 0 }]);
    }

    #[test]
    fn one_arm_is_rejected() {
        let x = array![[0.0], [1.0]];
        let rewards = array![[1.0], [2.0]];
        let err = PolicyTree::fit(x.view(), rewards.view(), 2, 1).unwrap_err();
        assert!(matches!(err, EstimatorError::TooFewArms(1)));
    }

    #[test]
    fn depth_beyond_the_cap_is_rejected() {
        let x = array![[0.0], [1.0]];
        let rewards = array![[1.0, 0.0], [0.0, 1.0]];
        assert!(PolicyTree::fit(x.view(), rewards.view(), MAX_POLICY_DEPTH, 1).is_ok());
        assert!(matches!(
            PolicyTree::fit(x.view(), rewards.view(), MAX_POLICY_DEPTH + 1, 1),
            Err(EstimatorError::InvalidParameter { name: "depth", .. })
        ));
    }

    #[test]
    fn describe_uses_names_and_arm_labels() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let rewards = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let tree = PolicyTree::fit(x.view(), rewards.view(), 1, 1).unwrap();
        let text = tree.describe(&["par_inc".to_string()], &["control", "treated"]);
        assert!(text.contains("split on par_inc <= 1.0000"));
        assert!(text.contains("* action = treated (2 rows)"));
    }
}
