// ========================================================================================
//
//                        GROVE CAUSAL FOREST FIT BENCHMARK
//
// ========================================================================================
//
// Measures how the honest causal forest fit and the exhaustive policy tree search
// scale with the number of rows. The forest uses precomputed nuisances so only the
// causal trees themselves are timed.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use grove::forest::causal::{CausalForest, CausalInputs};
use grove::forest::params::ForestParams;
use grove::policy::PolicyTree;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// --- Benchmark Tuning Parameters ---

/// Row counts on the x-axis of the report.
const ROW_COUNTS: [usize; 3] = [500, 2_000, 8_000];
const NUM_FEATURES: usize = 6;
/// Kept small so a full sweep finishes in minutes.
const NUM_TREES: usize = 100;

struct Problem {
    x: Array2<f64>,
    y: Array1<f64>,
    w: Array1<f64>,
    y_hat: Array1<f64>,
    w_hat: Array1<f64>,
}

fn simulate(n: usize) -> Problem {
    let mut rng = StdRng::seed_from_u64(7);
    let x = Array2::from_shape_fn((n, NUM_FEATURES), |_| rng.gen_range(0.0..1.0));
    let w = Array1::from_shape_fn(n, |_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 });
    let y = Array1::from_shape_fn(n, |i| {
        let tau = if x[[i, 0]] > 0.5 { 2.0 } else { 0.5 };
        x[[i, 1]] + tau * w[i] + rng.gen_range(-1.0..1.0)
    });
    let y_hat = Array1::from_shape_fn(n, |i| x[[i, 1]] + 0.5 * (if x[[i, 0]] > 0.5 { 2.0 } else { 0.5 }));
    Problem {
        x,
        y,
        w,
        y_hat,
        w_hat: Array1::from_elem(n, 0.5),
    }
}

fn benchmark_causal_forest(c: &mut Criterion) {
    let params = ForestParams {
        num_trees: NUM_TREES,
        ..ForestParams::default()
    };
    let mut group = c.benchmark_group("causal_forest_fit");
    group.sample_size(10);
    for &n in &ROW_COUNTS {
        let problem = simulate(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &problem, |b, p| {
            b.iter(|| {
                let inputs = CausalInputs {
                    x: p.x.view(),
                    y: p.y.view(),
                    w: p.w.view(),
                    y_hat: Some(p.y_hat.view()),
                    w_hat: Some(p.w_hat.view()),
                };
                let forest = CausalForest::fit(black_box(inputs), &params).unwrap();
                black_box(forest.predict());
            });
        });
    }
    group.finish();
}

fn benchmark_policy_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_tree_depth_2");
    group.sample_size(10);
    for &n in &ROW_COUNTS {
        let problem = simulate(n);
        let rewards = Array2::from_shape_fn((n, 2), |(i, arm)| {
            if arm == 1 { problem.y[i] - problem.y_hat[i] } else { 0.0 }
        });
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &rewards, |b, r| {
            b.iter(|| {
                let tree = PolicyTree::fit(problem.x.view(), black_box(r.view()), 2, 1).unwrap();
                black_box(tree.total_reward());
            });
        });
    }
    group.finish();
}

criterion_group!(forest_benches, benchmark_causal_forest, benchmark_policy_tree);
criterion_main!(forest_benches);
