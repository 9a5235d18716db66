//! Doubly robust inference on top of fitted CATE estimates.

use super::EstimatorError;
use super::stats::{self, Coefficient};
use log::warn;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip, s};
use serde::{Deserialize, Serialize};
use std::fmt;

const PROPENSITY_FLOOR: f64 = 0.01;
const PROPENSITY_CEILING: f64 = 0.99;

/// Rows of the omnibus calibration test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationTest {
    /// Coefficient on `tau_bar (W - W.hat)`; 1 when the mean prediction is correct.
    pub mean_forest_prediction: Coefficient,
    /// Coefficient on `(tau(x) - tau_bar)(W - W.hat)`; 1 when heterogeneity is well calibrated.
    pub differential_forest_prediction: Coefficient,
}

/// Population over which an average effect is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSample {
    All,
    Treated,
    Control,
    Overlap,
}

impl TargetSample {
    pub const ALL: [TargetSample; 4] = [
        TargetSample::All,
        TargetSample::Treated,
        TargetSample::Control,
        TargetSample::Overlap,
    ];
}

impl fmt::Display for TargetSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetSample::All => "all",
            TargetSample::Treated => "treated",
            TargetSample::Control => "control",
            TargetSample::Overlap => "overlap",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AverageEffect {
    pub estimate: f64,
    pub std_error: f64,
}

fn clipped_propensities(w_hat: ArrayView1<f64>) -> Array1<f64> {
    let clipped = w_hat
        .iter()
        .filter(|&&e| !(PROPENSITY_FLOOR..=PROPENSITY_CEILING).contains(&e))
        .count();
    if clipped > 0 {
        warn!(
            "{clipped} propensity estimates fall outside [{PROPENSITY_FLOOR}, {PROPENSITY_CEILING}] and were clipped; overlap may be poor"
        );
    }
    w_hat.mapv(|e| e.clamp(PROPENSITY_FLOOR, PROPENSITY_CEILING))
}

/// AIPW scores `tau + (W - e)/(e(1 - e)) (Y - m - (W - e) tau)`.
pub fn aipw_scores(
    y: ArrayView1<f64>,
    w: ArrayView1<f64>,
    y_hat: ArrayView1<f64>,
    w_hat: ArrayView1<f64>,
    tau: ArrayView1<f64>,
) -> Array1<f64> {
    let e = clipped_propensities(w_hat);
    let mut scores = Array1::zeros(y.len());
    Zip::from(&mut scores)
        .and(&y)
        .and(&w)
        .and(&y_hat)
        .and(&e)
        .and(&tau)
        .for_each(|score, &y, &w, &m, &e, &tau| {
            let residual = y - m - (w - e) * tau;
            *score = tau + (w - e) / (e * (1.0 - e)) * residual;
        });
    scores
}

/// Per-arm doubly robust rewards, columns ordered (control, treated).
pub fn double_robust_scores(
    y: ArrayView1<f64>,
    w: ArrayView1<f64>,
    y_hat: ArrayView1<f64>,
    w_hat: ArrayView1<f64>,
    tau: ArrayView1<f64>,
) -> Array2<f64> {
    let e = clipped_propensities(w_hat);
    let mut scores = Array2::zeros((y.len(), 2));
    for i in 0..y.len() {
        let mu_control = y_hat[i] - e[i] * tau[i];
        let mu_treated = y_hat[i] + (1.0 - e[i]) * tau[i];
        scores[[i, 0]] = mu_control + (1.0 - w[i]) / (1.0 - e[i]) * (y[i] - mu_control);
        scores[[i, 1]] = mu_treated + w[i] / e[i] * (y[i] - mu_treated);
    }
    scores
}

/// Weighted mean of the AIPW scores for `target`.
pub fn average_treatment_effect(
    scores: ArrayView1<f64>,
    w_hat: ArrayView1<f64>,
    target: TargetSample,
) -> Result<AverageEffect, EstimatorError> {
    let n = scores.len();
    if n < 2 {
        return Err(EstimatorError::EmptySample);
    }
    if w_hat.len() != n {
        return Err(EstimatorError::Shape(format!(
            "{n} scores but {} propensities",
            w_hat.len()
        )));
    }

    if target == TargetSample::All {
        let estimate = scores.sum() / n as f64;
        let std_error = scores.std(1.0) / (n as f64).sqrt();
        return Ok(AverageEffect {
            estimate,
            std_error,
        });
    }

    let e = w_hat.mapv(|e| e.clamp(PROPENSITY_FLOOR, PROPENSITY_CEILING));
    let weights = match target {
        TargetSample::Treated => e,
        TargetSample::Control => e.mapv(|e| 1.0 - e),
        TargetSample::Overlap => e.mapv(|e| e * (1.0 - e)),
        TargetSample::All => Array1::ones(n),
    };
    let total = weights.sum();
    let estimate = weights.dot(&scores) / total;
    let spread: f64 = weights
        .iter()
        .zip(scores.iter())
        .map(|(w, g)| (w * (g - estimate)).powi(2))
        .sum();
    Ok(AverageEffect {
        estimate,
        std_error: spread.sqrt() / total,
    })
}

/// Regresses `Y - Y.hat` on the mean and differential forest predictions.
pub fn test_calibration(
    y_tilde: ArrayView1<f64>,
    w_tilde: ArrayView1<f64>,
    tau: ArrayView1<f64>,
) -> Result<CalibrationTest, EstimatorError> {
    let n = tau.len();
    let tau_bar = tau.sum() / n.max(1) as f64;
    let mut design = Array2::zeros((n, 2));
    for i in 0..n {
        design[[i, 0]] = tau_bar * w_tilde[i];
        design[[i, 1]] = (tau[i] - tau_bar) * w_tilde[i];
    }
    if design.column(1).iter().all(|v| v.abs() < 1e-12) {
        return Err(EstimatorError::DegenerateDesign(
            "the forest predicts a constant effect, so the differential prediction is identically zero"
                .to_string(),
        ));
    }
    let fit = stats::ols_hc3(design.view(), y_tilde)?;
    let coefficient = |index: usize| -> Result<Coefficient, EstimatorError> {
        let t_value = fit.t_value(index);
        Ok(Coefficient {
            estimate: fit.estimates[index],
            std_error: fit.std_errors[index],
            t_value,
            p_value: stats::upper_tail_p(t_value, fit.residual_df)?,
        })
    };
    Ok(CalibrationTest {
        mean_forest_prediction: coefficient(0)?,
        differential_forest_prediction: coefficient(1)?,
    })
}

/// OLS with intercept of the AIPW scores on `covariates`. The first coefficient
/// is the intercept.
pub fn best_linear_projection(
    scores: ArrayView1<f64>,
    covariates: ArrayView2<f64>,
) -> Result<Vec<Coefficient>, EstimatorError> {
    let (n, k) = covariates.dim();
    if scores.len() != n {
        return Err(EstimatorError::Shape(format!(
            "{} scores but {n} covariate rows",
            scores.len()
        )));
    }
    let mut design = Array2::ones((n, k + 1));
    design.slice_mut(s![.., 1..]).assign(&covariates);
    let fit = stats::ols_hc3(design.view(), scores)?;
    (0..=k)
        .map(|index| {
            let t_value = fit.t_value(index);
            Ok(Coefficient {
                estimate: fit.estimates[index],
                std_error: fit.std_errors[index],
                t_value,
                p_value: stats::two_sided_p(t_value, fit.residual_df)?,
            })
        })
        .collect()
}

/// Mean of `scores` within each group, for groups `1..=k`. Groups with fewer
/// than two members get a `NaN` standard error.
pub fn group_effects(
    scores: ArrayView1<f64>,
    groups: &[u32],
    k: u32,
) -> Result<Vec<AverageEffect>, EstimatorError> {
    if groups.len() != scores.len() {
        return Err(EstimatorError::Shape(format!(
            "{} scores but {} group labels",
            scores.len(),
            groups.len()
        )));
    }
    Ok((1..=k)
        .map(|group| {
            let members: Array1<f64> = groups
                .iter()
                .zip(scores.iter())
                .filter(|(g, _)| **g == group)
                .map(|(_, s)| *s)
                .collect();
            let n = members.len() as f64;
            let std_error = if members.len() < 2 {
                f64::NAN
            } else {
                members.std(1.0) / n.sqrt()
            };
            AverageEffect {
                estimate: members.mean().unwrap_or(f64::NAN),
                std_error,
            }
        })
        .collect())
}
