//! Random-search tuning of causal forest parameters on out-of-bag R-loss.

use super::EstimatorError;
use super::causal::{CausalForest, Prepared};
use super::params::ForestParams;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneSettings {
    /// Number of random parameter draws.
    pub num_draws: usize,
    /// Trees per candidate forest.
    pub num_trees: usize,
}

impl Default for TuneSettings {
    fn default() -> Self {
        Self {
            num_draws: 20,
            num_trees: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneOutcome {
    /// Chosen parameters, with the caller's `num_trees` and `seed` restored.
    pub params: ForestParams,
    pub loss: f64,
    pub default_loss: f64,
    pub candidates_evaluated: usize,
}

fn draw_candidate(base: &ForestParams, n: usize, p: usize, rng: &mut StdRng) -> ForestParams {
    let log_n = (n as f64).log2();
    let min_node_exponent = rng.gen_range(0.0..1.0) * (log_n - 4.0).max(0.0);
    let uniform_open: f64 = rng.gen_range(f64::EPSILON..1.0);
    ForestParams {
        sample_fraction: rng.gen_range(0.05..0.5),
        mtry: Some(rng.gen_range(1..=p)),
        min_node_size: (2f64.powf(min_node_exponent).floor() as usize).max(1),
        honesty_fraction: rng.gen_range(0.5..0.8),
        alpha: rng.gen_range(0.0..0.25),
        imbalance_penalty: -uniform_open.ln(),
        ..base.clone()
    }
}

pub(crate) fn tune_causal_forest(
    data: &Prepared,
    base: &ForestParams,
    settings: &TuneSettings,
) -> Result<TuneOutcome, EstimatorError> {
    let (n, p) = data.x.dim();
    if settings.num_draws == 0 || settings.num_trees == 0 {
        return Err(EstimatorError::InvalidParameter {
            name: "tuning",
            reason: "num_draws and num_trees must both be positive".to_string(),
        });
    }
    info!(
        "Tuning causal forest: {} random draws of {}-tree forests",
        settings.num_draws, settings.num_trees
    );

    let small = |params: &ForestParams| ForestParams {
        num_trees: settings.num_trees,
        ..params.clone()
    };
    let default_loss = CausalForest::grow(data.clone(), &small(base), false)?.r_loss();
    let mut best = (base.clone(), default_loss);
    let mut evaluated = 1usize;

    let mut rng = StdRng::seed_from_u64(base.seed.wrapping_add(0x7475_6e65));
    for draw in 0..settings.num_draws {
        let candidate = draw_candidate(base, n, p, &mut rng);
        let forest = match CausalForest::grow(data.clone(), &small(&candidate), false) {
            Ok(forest) => forest,
            Err(
                error @ (EstimatorError::InvalidParameter { .. } | EstimatorError::TooFewRows { .. }),
            ) => {
                debug!("Skipping tuning draw {draw}: {error}");
                continue;
            }
            Err(error) => return Err(error),
        };
        evaluated += 1;
        let loss = forest.r_loss();
        debug!("Tuning draw {draw}: R-loss {loss:.6} with {candidate:?}");
        if loss.is_finite() && loss < best.1 {
            best = (candidate, loss);
        }
    }

    let (chosen, loss) = best;
    info!("Tuned R-loss {loss:.6} (defaults: {default_loss:.6}) over {evaluated} candidates");
    Ok(TuneOutcome {
        params: ForestParams {
            num_trees: base.num_trees,
            seed: base.seed,
            ..chosen
        },
        loss,
        default_loss,
        candidates_evaluated: evaluated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::causal::CausalInputs;
    use ndarray::{Array1, Array2};

    #[test]
    fn candidates_stay_inside_their_ranges() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = ForestParams::default();
        for _ in 0..200 {
            let c = draw_candidate(&base, 1000, 4, &mut rng);
            assert!((0.05..0.5).contains(&c.sample_fraction));
            assert!(matches!(c.mtry, Some(m) if (1..=4).contains(&m)));
            assert!(c.min_node_size >= 1 && c.min_node_size <= 64);
            assert!((0.5..0.8).contains(&c.honesty_fraction));
            assert!((0.0..0.25).contains(&c.alpha));
            assert!(c.imbalance_penalty >= 0.0 && c.imbalance_penalty.is_finite());
            assert_eq!(c.num_trees, base.num_trees);
        }
    }

    #[test]
    fn tuning_never_does_worse_than_defaults() {
        let mut rng = StdRng::seed_from_u64(2);
        let n = 400;
        let x = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.0..1.0));
        let w = Array1::from_shape_fn(n, |i| (i % 2) as f64);
        let y = Array1::from_shape_fn(n, |i| w[i] * (1.0 + x[[i, 0]]) + rng.gen_range(-0.3..0.3));
        let w_hat = Array1::from_elem(n, 0.5);
        let y_hat = Array1::from_elem(n, y.mean().unwrap_or(0.0));
        let inputs = CausalInputs {
            x: x.view(),
            y: y.view(),
            w: w.view(),
            y_hat: Some(y_hat.view()),
            w_hat: Some(w_hat.view()),
        };
        let base = ForestParams {
            num_trees: 100,
            ..ForestParams::default()
        };
        let settings = TuneSettings {
            num_draws: 4,
            num_trees: 50,
        };
        let (forest, outcome) = CausalForest::fit_tuned(inputs, &base, &settings).unwrap();
        assert!(outcome.loss <= outcome.default_loss);
        assert!(outcome.candidates_evaluated >= 1);
        assert_eq!(outcome.params.num_trees, 100);
        assert_eq!(forest.num_trees(), 100);
    }
}
