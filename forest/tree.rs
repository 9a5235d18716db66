//! Honest recursive partitioning shared by every forest in the crate.
//!
//! A tree is grown on one half of its subsample and its leaves are filled with
//! the other half. What a split optimises is supplied by a `SplitTargets`
//! implementation: regression forests split on the raw outcome, causal forests
//! on a per-node pseudo-outcome.

use super::params::ForestParams;
use itertools::Itertools;
use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::seq::index::sample;
use std::fmt::Write as FmtWrite;

/// Responses used to score candidate splits in one node.
pub(crate) struct NodeResponses {
    /// One value per node sample, in the order the samples were given.
    pub values: Vec<f64>,
    /// When present, every child must contain rows from both arms.
    pub arms: Option<Vec<bool>>,
}

pub(crate) trait SplitTargets: Sync {
    /// Returns `None` when the node cannot be split any further.
    fn responses(&self, samples: &[usize]) -> Option<NodeResponses>;
}

#[derive(Debug, Clone)]
pub enum Node {
    Split {
        variable: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        samples: Vec<usize>,
    },
}

/// One fitted tree. Leaves hold the estimation rows that landed in them.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    /// Rows drawn for this tree, sorted; every other row is out-of-bag.
    drawn: Vec<usize>,
}

pub(crate) struct GrowContext<'a> {
    pub x: ArrayView2<'a, f64>,
    pub params: &'a ForestParams,
    pub mtry: usize,
}

struct Candidate {
    gain: f64,
    variable: usize,
    threshold: f64,
}

impl Tree {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn drawn(&self) -> &[usize] {
        &self.drawn
    }

    /// Whether `row` was part of this tree's subsample.
    pub fn is_in_bag(&self, row: usize) -> bool {
        self.drawn.binary_search(&row).is_ok()
    }

    /// Estimation rows in the leaf that `point` falls into.
    pub fn leaf_samples(&self, point: ArrayView1<f64>) -> &[usize] {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Split {
                    variable,
                    threshold,
                    left,
                    right,
                } => {
                    index = if point[*variable] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                Node::Leaf { samples } => return samples,
            }
        }
    }

    /// Number of leaves reachable from the root.
    pub fn num_leaves(&self) -> usize {
        let mut count = 0;
        self.visit(|_, node| {
            if matches!(node, Node::Leaf { .. }) {
                count += 1;
            }
        });
        count
    }

    /// Calls `f(depth, node)` for every node reachable from the root, parents first.
    pub fn visit<F: FnMut(usize, &Node)>(&self, mut f: F) {
        let mut stack = vec![(0usize, 0usize)];
        while let Some((index, depth)) = stack.pop() {
            let node = &self.nodes[index];
            f(depth, node);
            if let Node::Split { left, right, .. } = node {
                stack.push((*right, depth + 1));
                stack.push((*left, depth + 1));
            }
        }
    }

    /// Human-readable rendering, one node per line, indented by depth.
    pub fn describe(&self, names: &[String]) -> String {
        let mut out = String::new();
        let mut label = 0usize;
        self.visit(|depth, node| {
            label += 1;
            let indent = "  ".repeat(depth);
            match node {
                Node::Split {
                    variable,
                    threshold,
                    ..
                } => {
                    let name = names
                        .get(*variable)
                        .cloned()
                        .unwrap_or_else(|| format!("X{}", variable + 1));
                    let _ = writeln!(
                        out,
                        "{indent}node {label} (depth {depth}): split on {name} <= {threshold:.4}"
                    );
                }
                Node::Leaf { samples } => {
                    let _ = writeln!(
                        out,
                        "{indent}leaf {label} (depth {depth}): {} estimation rows",
                        samples.len()
                    );
                }
            }
        });
        out
    }

    /// Replaces a split whose child has no estimation rows by the other child.
    fn prune(&mut self, index: usize) -> bool {
        let (left, right) = match &self.nodes[index] {
            Node::Leaf { samples } => return !samples.is_empty(),
            Node::Split { left, right, .. } => (*left, *right),
        };
        let left_kept = self.prune(left);
        let right_kept = self.prune(right);
        match (left_kept, right_kept) {
            (true, true) => true,
            (true, false) => {
                self.nodes[index] = self.nodes[left].clone();
                true
            }
            (false, true) => {
                self.nodes[index] = self.nodes[right].clone();
                true
            }
            (false, false) => {
                self.nodes[index] = Node::Leaf {
                    samples: Vec::new(),
                };
                false
            }
        }
    }

    fn route(&mut self, x: ArrayView2<f64>, rows: &[usize]) {
        for node in &mut self.nodes {
            if let Node::Leaf { samples } = node {
                samples.clear();
            }
        }
        for &row in rows {
            let mut index = 0;
            loop {
                match &self.nodes[index] {
                    Node::Split {
                        variable,
                        threshold,
                        left,
                        right,
                    } => {
                        index = if x[[row, *variable]] <= *threshold {
                            *left
                        } else {
                            *right
                        };
                    }
                    Node::Leaf { .. } => break,
                }
            }
            if let Node::Leaf { samples } = &mut self.nodes[index] {
                samples.push(row);
            }
        }
    }
}

/// Grows one tree on a random subsample of `0..n`. Parameters must already
/// have been validated against `n`.
pub(crate) fn grow<T: SplitTargets>(
    ctx: &GrowContext<'_>,
    targets: &T,
    n: usize,
    rng: &mut StdRng,
) -> Tree {
    let params = ctx.params;
    let drawn_count = params.subsample_size(n).min(n);
    let mut drawn = sample(rng, n, drawn_count).into_vec();
    drawn.shuffle(rng);

    let (growing, estimation) = if params.honesty {
        let cut = ((drawn.len() as f64) * params.honesty_fraction).ceil() as usize;
        let cut = cut.clamp(1, drawn.len() - 1);
        (drawn[..cut].to_vec(), drawn[cut..].to_vec())
    } else {
        (drawn.clone(), drawn.clone())
    };

    let mut nodes = vec![Node::Leaf {
        samples: growing,
    }];
    let mut pending = vec![0usize];
    while let Some(index) = pending.pop() {
        let samples = match &nodes[index] {
            Node::Leaf { samples } => samples.clone(),
            Node::Split { .. } => continue,
        };
        let Some(candidate) = best_split(ctx, targets, &samples, rng) else {
            continue;
        };
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .copied()
            .partition(|&row| ctx.x[[row, candidate.variable]] <= candidate.threshold);
        let left = nodes.len();
        nodes.push(Node::Leaf { samples: left_rows });
        let right = nodes.len();
        nodes.push(Node::Leaf {
            samples: right_rows,
        });
        nodes[index] = Node::Split {
            variable: candidate.variable,
            threshold: candidate.threshold,
            left,
            right,
        };
        pending.push(right);
        pending.push(left);
    }

    drawn.sort_unstable();
    let mut tree = Tree { nodes, drawn };
    if params.honesty {
        tree.route(ctx.x, &estimation);
        if params.honesty_prune_leaves {
            tree.prune(0);
        }
    }
    tree
}

fn best_split<T: SplitTargets>(
    ctx: &GrowContext<'_>,
    targets: &T,
    samples: &[usize],
    rng: &mut StdRng,
) -> Option<Candidate> {
    let params = ctx.params;
    let m = samples.len();
    let min_child = params
        .min_node_size
        .max((params.alpha * m as f64).ceil() as usize)
        .max(1);
    if m < 2 * min_child {
        return None;
    }
    let responses = targets.responses(samples)?;

    let total: f64 = responses.values.iter().sum();
    let baseline = total * total / m as f64;
    let variables = sample(rng, ctx.x.ncols(), ctx.mtry)
        .into_iter()
        .sorted_unstable()
        .collect_vec();

    let mut best: Option<Candidate> = None;
    for variable in variables {
        let order = (0..m)
            .sorted_by(|&a, &b| {
                ctx.x[[samples[a], variable]].total_cmp(&ctx.x[[samples[b], variable]])
            })
            .collect_vec();
        let arms_total = responses
            .arms
            .as_ref()
            .map(|arms| arms.iter().filter(|&&a| a).count());

        let mut left_sum = 0.0;
        let mut left_arm = 0usize;
        for k in 1..m {
            let position = order[k - 1];
            left_sum += responses.values[position];
            if let Some(arms) = &responses.arms {
                if arms[position] {
                    left_arm += 1;
                }
            }
            if k < min_child || m - k < min_child {
                continue;
            }
            let here = ctx.x[[samples[position], variable]];
            let next = ctx.x[[samples[order[k]], variable]];
            if here >= next {
                continue;
            }
            if let Some(total_arm) = arms_total {
                let right_arm = total_arm - left_arm;
                let both_left = left_arm > 0 && left_arm < k;
                let both_right = right_arm > 0 && right_arm < m - k;
                if !both_left || !both_right {
                    continue;
                }
            }
            let right_sum = total - left_sum;
            let mut gain = left_sum * left_sum / k as f64
                + right_sum * right_sum / (m - k) as f64
                - baseline;
            gain -= params.imbalance_penalty * (1.0 / k as f64 + 1.0 / (m - k) as f64);
            if gain > 1e-12 && best.as_ref().is_none_or(|b| gain > b.gain) {
                best = Some(Candidate {
                    gain,
                    variable,
                    threshold: here,
                });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};
    use rand::SeedableRng;

    struct Raw(Array1<f64>);

    impl SplitTargets for Raw {
        fn responses(&self, samples: &[usize]) -> Option<NodeResponses> {
            Some(NodeResponses {
                values: samples.iter().map(|&i| self.0[i]).collect(),
                arms: None,
            })
        }
    }

    fn step_data(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 7) as f64 });
        let y = Array1::from_shape_fn(n, |i| if i < n / 2 { 0.0 } else { 10.0 });
        (x, y)
    }

    #[test]
    fn adaptive_tree_finds_the_step() {
        let (x, y) = step_data(200);
        let params = ForestParams {
            honesty: false,
            sample_fraction: 1.0,
            ..ForestParams::default()
        };
        let ctx = GrowContext {
            x: x.view(),
            params: &params,
            mtry: 2,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let tree = grow(&ctx, &Raw(y), 200, &mut rng);
        match &tree.nodes()[0] {
            Node::Split {
                variable,
                threshold,
                ..
            } => {
                assert_eq!(*variable, 0);
                assert_eq!(*threshold, 99.0);
            }
            Node::Leaf { .. } => panic!("root should split"),
        }
    }

    #[test]
    fn honest_leaves_hold_only_estimation_rows() {
        let (x, y) = step_data(400);
        let params = ForestParams::default();
        let ctx = GrowContext {
            x: x.view(),
            params: &params,
            mtry: 2,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let tree = grow(&ctx, &Raw(y), 400, &mut rng);
        let mut total = 0;
        tree.visit(|_, node| {
            if let Node::Leaf { samples } = node {
                assert!(!samples.is_empty(), "pruned trees have no empty leaves");
                for row in samples {
                    assert!(tree.is_in_bag(*row));
                }
                total += samples.len();
            }
        });
        assert_eq!(tree.drawn().len(), 200);
        assert_eq!(total, 100);
        assert!(tree.num_leaves() >= 2);
    }

    #[test]
    fn describe_names_split_variables() {
        let (x, y) = step_data(100);
        let params = ForestParams {
            honesty: false,
            sample_fraction: 1.0,
            ..ForestParams::default()
        };
        let ctx = GrowContext {
            x: x.view(),
            params: &params,
            mtry: 2,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let tree = grow(&ctx, &Raw(y), 100, &mut rng);
        let text = tree.describe(&["par_inc".to_string(), "par_sch".to_string()]);
        assert!(text.starts_with("node 1 (depth 0): split on par_inc"));
    }
}
