//! Causal forests for heterogeneous treatment effects.
//!
//! Both the outcome and the treatment are centred on their nuisance predictions
//! (`Y~ = Y - Y.hat`, `W~ = W - W.hat`) before any tree is grown. Splits are
//! chosen on the gradient pseudo-outcome
//!
//! `rho_i = (W~_i - W~_P)(Y~_i - Y~_P - tau_P (W~_i - W~_P)) / Var_P(W~)`
//!
//! computed afresh in every node `P`, and the effect at `x` is the forest-weighted
//! residual-on-residual slope.

use super::inference::{self, AverageEffect, CalibrationTest, TargetSample};
use super::params::ForestParams;
use super::regression::RegressionForest;
use super::tree::{NodeResponses, SplitTargets, Tree};
use super::tune::{self, TuneOutcome, TuneSettings};
use super::{EstimatorError, forest_weights, grow_trees, variable_importance};
use ahash::AHashMap;
use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use rayon::prelude::*;

/// Borrowed inputs for fitting a causal forest.
#[derive(Debug, Clone, Copy)]
pub struct CausalInputs<'a> {
    pub x: ArrayView2<'a, f64>,
    pub y: ArrayView1<'a, f64>,
    pub w: ArrayView1<'a, f64>,
    /// Pre-computed `E[Y | X]`. Estimated with a regression forest when absent.
    pub y_hat: Option<ArrayView1<'a, f64>>,
    /// Pre-computed `E[W | X]`. Estimated with a regression forest when absent.
    pub w_hat: Option<ArrayView1<'a, f64>>,
}

/// Validated inputs with nuisance predictions filled in.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub w: Array1<f64>,
    pub y_hat: Array1<f64>,
    pub w_hat: Array1<f64>,
}

impl Prepared {
    pub fn y_tilde(&self) -> Array1<f64> {
        &self.y - &self.y_hat
    }

    pub fn w_tilde(&self) -> Array1<f64> {
        &self.w - &self.w_hat
    }
}

struct CausalTargets<'a> {
    y_tilde: ArrayView1<'a, f64>,
    w_tilde: ArrayView1<'a, f64>,
}

impl SplitTargets for CausalTargets<'_> {
    fn responses(&self, samples: &[usize]) -> Option<NodeResponses> {
        let m = samples.len() as f64;
        let w_mean = samples.iter().map(|&i| self.w_tilde[i]).sum::<f64>() / m;
        let y_mean = samples.iter().map(|&i| self.y_tilde[i]).sum::<f64>() / m;
        let mut cross = 0.0;
        let mut spread = 0.0;
        for &i in samples {
            let dw = self.w_tilde[i] - w_mean;
            cross += dw * (self.y_tilde[i] - y_mean);
            spread += dw * dw;
        }
        let variance = spread / m;
        if variance <= 1e-12 {
            return None;
        }
        let tau = cross / spread;
        let values = samples
            .iter()
            .map(|&i| {
                let dw = self.w_tilde[i] - w_mean;
                dw * ((self.y_tilde[i] - y_mean) - dw * tau) / variance
            })
            .collect();
        let arms = samples.iter().map(|&i| self.w_tilde[i] > w_mean).collect();
        Some(NodeResponses {
            values,
            arms: Some(arms),
        })
    }
}

/// A fitted causal forest together with the data it was trained on.
#[derive(Debug, Clone)]
pub struct CausalForest {
    trees: Vec<Tree>,
    data: Prepared,
    y_tilde: Array1<f64>,
    w_tilde: Array1<f64>,
    tau_oob: Array1<f64>,
}

impl CausalForest {
    pub fn fit(inputs: CausalInputs<'_>, params: &ForestParams) -> Result<Self, EstimatorError> {
        let prepared = Self::prepare(inputs, params)?;
        Self::grow(prepared, params, true)
    }

    /// Tunes the forest parameters on the centred data, then fits the final
    /// forest with the chosen parameters.
    pub fn fit_tuned(
        inputs: CausalInputs<'_>,
        params: &ForestParams,
        settings: &TuneSettings,
    ) -> Result<(Self, TuneOutcome), EstimatorError> {
        let prepared = Self::prepare(inputs, params)?;
        let outcome = tune::tune_causal_forest(&prepared, params, settings)?;
        let forest = Self::grow(prepared, &outcome.params, true)?;
        Ok((forest, outcome))
    }

    pub(crate) fn prepare(
        inputs: CausalInputs<'_>,
        params: &ForestParams,
    ) -> Result<Prepared, EstimatorError> {
        let n = inputs.x.nrows();
        if n == 0 {
            return Err(EstimatorError::EmptySample);
        }
        let check = |what: &str, len: usize| {
            if len == n {
                Ok(())
            } else {
                Err(EstimatorError::Shape(format!(
                    "X has {n} rows but {what} has {len}"
                )))
            }
        };
        check("Y", inputs.y.len())?;
        check("W", inputs.w.len())?;
        if let Some(y_hat) = inputs.y_hat {
            check("Y.hat", y_hat.len())?;
        }
        if let Some(w_hat) = inputs.w_hat {
            check("W.hat", w_hat.len())?;
        }

        if inputs.x.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("the covariate matrix"));
        }
        if inputs.y.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("the outcome"));
        }
        if inputs.w.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("the treatment"));
        }
        // The doubly robust scores and the two-arm policy rewards assume a binary treatment.
        if let Some((row, &value)) = inputs
            .w
            .iter()
            .enumerate()
            .find(|(_, v)| **v != 0.0 && **v != 1.0)
        {
            return Err(EstimatorError::NonBinaryTreatment { row, value });
        }
        if inputs.w.iter().all(|&v| v == inputs.w[0]) {
            return Err(EstimatorError::NoTreatmentVariation);
        }

        let nuisance = params.nuisance();
        let y_hat = match inputs.y_hat {
            Some(y_hat) => y_hat.to_owned(),
            None => {
                info!("Estimating Y.hat with a regression forest");
                RegressionForest::fit(inputs.x, inputs.y, &nuisance)?.predict_oob()
            }
        };
        let w_hat = match inputs.w_hat {
            Some(w_hat) => w_hat.to_owned(),
            None => {
                info!("Estimating W.hat with a regression forest");
                RegressionForest::fit(inputs.x, inputs.w, &nuisance)?.predict_oob()
            }
        };
        if y_hat.iter().chain(w_hat.iter()).any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("the nuisance predictions"));
        }

        Ok(Prepared {
            x: inputs.x.to_owned(),
            y: inputs.y.to_owned(),
            w: inputs.w.to_owned(),
            y_hat,
            w_hat,
        })
    }

    pub(crate) fn grow(
        data: Prepared,
        params: &ForestParams,
        show_progress: bool,
    ) -> Result<Self, EstimatorError> {
        let y_tilde = data.y_tilde();
        let w_tilde = data.w_tilde();
        if show_progress {
            info!(
                "Fitting causal forest: {} rows, {} covariates, {} trees",
                data.x.nrows(),
                data.x.ncols(),
                params.num_trees
            );
        }
        let targets = CausalTargets {
            y_tilde: y_tilde.view(),
            w_tilde: w_tilde.view(),
        };
        let trees = grow_trees(
            data.x.view(),
            &targets,
            params,
            "causal forest",
            show_progress,
        )?;

        let mut forest = Self {
            trees,
            data,
            y_tilde,
            w_tilde,
            tau_oob: Array1::zeros(0),
        };
        let fallback = forest.global_effect();
        let estimates: Vec<Option<f64>> = (0..forest.data.x.nrows())
            .into_par_iter()
            .map(|row| forest.estimate(forest.data.x.row(row), Some(row)))
            .collect();
        let missing = estimates.iter().filter(|e| e.is_none()).count();
        if missing > 0 {
            warn!(
                "{missing} rows had no usable out-of-bag trees; their CATE falls back to the pooled estimate {fallback:.4}"
            );
        }
        forest.tau_oob = estimates
            .into_iter()
            .map(|e| e.unwrap_or(fallback))
            .collect();
        Ok(forest)
    }

    /// Out-of-bag CATE estimates, one per training row.
    pub fn predict(&self) -> Array1<f64> {
        self.tau_oob.clone()
    }

    /// CATE estimates for new covariate rows, using every tree.
    pub fn predict_new(&self, x_new: ArrayView2<f64>) -> Result<Array1<f64>, EstimatorError> {
        if x_new.ncols() != self.data.x.ncols() {
            return Err(EstimatorError::Shape(format!(
                "the forest was trained on {} covariates but {} were supplied",
                self.data.x.ncols(),
                x_new.ncols()
            )));
        }
        let fallback = self.global_effect();
        let estimates: Vec<f64> = (0..x_new.nrows())
            .into_par_iter()
            .map(|row| self.estimate(x_new.row(row), None).unwrap_or(fallback))
            .collect();
        Ok(Array1::from_vec(estimates))
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Tree `index` of the forest.
    pub fn tree(&self, index: usize) -> Result<&Tree, EstimatorError> {
        self.trees.get(index).ok_or(EstimatorError::TreeIndex {
            index,
            num_trees: self.trees.len(),
        })
    }

    /// Split-frequency importance of each covariate (decay 2, depth 4).
    pub fn variable_importance(&self) -> Vec<f64> {
        variable_importance(&self.trees, self.data.x.ncols(), 2.0, 4)
    }

    pub fn test_calibration(&self) -> Result<CalibrationTest, EstimatorError> {
        inference::test_calibration(self.y_tilde.view(), self.w_tilde.view(), self.tau_oob.view())
    }

    /// Per-row AIPW scores of the treatment effect.
    pub fn aipw_scores(&self) -> Array1<f64> {
        inference::aipw_scores(
            self.data.y.view(),
            self.data.w.view(),
            self.data.y_hat.view(),
            self.data.w_hat.view(),
            self.tau_oob.view(),
        )
    }

    pub fn average_treatment_effect(
        &self,
        target: TargetSample,
    ) -> Result<AverageEffect, EstimatorError> {
        inference::average_treatment_effect(self.aipw_scores().view(), self.data.w_hat.view(), target)
    }

    /// Per-arm doubly robust rewards, columns ordered (control, treated).
    pub fn double_robust_scores(&self) -> Array2<f64> {
        inference::double_robust_scores(
            self.data.y.view(),
            self.data.w.view(),
            self.data.y_hat.view(),
            self.data.w_hat.view(),
            self.tau_oob.view(),
        )
    }

    /// Out-of-bag R-loss `mean((Y~ - tau(x) W~)^2)`.
    pub fn r_loss(&self) -> f64 {
        let mut total = 0.0;
        Zip::from(&self.y_tilde)
            .and(&self.w_tilde)
            .and(&self.tau_oob)
            .for_each(|&y, &w, &tau| {
                let residual = y - tau * w;
                total += residual * residual;
            });
        total / self.tau_oob.len().max(1) as f64
    }

    /// Residual-on-residual slope over all training rows.
    fn global_effect(&self) -> f64 {
        let weights: AHashMap<usize, f64> = (0..self.y_tilde.len()).map(|i| (i, 1.0)).collect();
        self.weighted_slope(&weights).unwrap_or(0.0)
    }

    fn estimate(&self, point: ArrayView1<f64>, exclude: Option<usize>) -> Option<f64> {
        let weights = forest_weights(&self.trees, point, exclude)?;
        self.weighted_slope(&weights)
    }

    fn weighted_slope(&self, weights: &AHashMap<usize, f64>) -> Option<f64> {
        let mut total = 0.0;
        let mut w_sum = 0.0;
        let mut y_sum = 0.0;
        for (&row, &a) in weights {
            total += a;
            w_sum += a * self.w_tilde[row];
            y_sum += a * self.y_tilde[row];
        }
        if total <= 0.0 {
            return None;
        }
        let w_mean = w_sum / total;
        let y_mean = y_sum / total;
        let mut cross = 0.0;
        let mut spread = 0.0;
        for (&row, &a) in weights {
            let dw = self.w_tilde[row] - w_mean;
            cross += a * dw * (self.y_tilde[row] - y_mean);
            spread += a * dw * dw;
        }
        (spread > 1e-12 * total).then(|| cross / spread)
    }
}
