use super::params::ForestParams;
use super::tree::{NodeResponses, SplitTargets, Tree};
use super::{EstimatorError, forest_weights, grow_trees};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

struct RegressionTargets<'a> {
    y: ArrayView1<'a, f64>,
}

impl SplitTargets for RegressionTargets<'_> {
    fn responses(&self, samples: &[usize]) -> Option<NodeResponses> {
        Some(NodeResponses {
            values: samples.iter().map(|&i| self.y[i]).collect(),
            arms: None,
        })
    }
}

/// A forest estimating the conditional mean `E[Y | X = x]`.
#[derive(Debug, Clone)]
pub struct RegressionForest {
    trees: Vec<Tree>,
    x: Array2<f64>,
    y: Array1<f64>,
}

impl RegressionForest {
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        params: &ForestParams,
    ) -> Result<Self, EstimatorError> {
        if x.nrows() != y.len() {
            return Err(EstimatorError::Shape(format!(
                "X has {} rows but the target has {}",
                x.nrows(),
                y.len()
            )));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("the regression target"));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("the covariate matrix"));
        }
        info!(
            "Fitting regression forest: {} rows, {} covariates, {} trees",
            x.nrows(),
            x.ncols(),
            params.num_trees
        );
        let targets = RegressionTargets { y };
        let trees = grow_trees(x, &targets, params, "regression forest", true)?;
        Ok(Self {
            trees,
            x: x.to_owned(),
            y: y.to_owned(),
        })
    }

    /// Out-of-bag predictions for the training rows.
    pub fn predict_oob(&self) -> Array1<f64> {
        let fallback = self.y.mean().unwrap_or(0.0);
        let predictions: Vec<Option<f64>> = (0..self.x.nrows())
            .into_par_iter()
            .map(|row| self.estimate(self.x.row(row), Some(row)))
            .collect();
        let missing = predictions.iter().filter(|p| p.is_none()).count();
        if missing > 0 {
            debug!("{missing} rows had no out-of-bag trees; using the sample mean for them");
        }
        predictions
            .into_iter()
            .map(|p| p.unwrap_or(fallback))
            .collect()
    }

    /// Predictions for new rows, using every tree.
    pub fn predict(&self, x_new: ArrayView2<f64>) -> Result<Array1<f64>, EstimatorError> {
        if x_new.ncols() != self.x.ncols() {
            return Err(EstimatorError::Shape(format!(
                "the forest was trained on {} covariates but {} were supplied",
                self.x.ncols(),
                x_new.ncols()
            )));
        }
        let fallback = self.y.mean().unwrap_or(0.0);
        let predictions: Vec<f64> = (0..x_new.nrows())
            .into_par_iter()
            .map(|row| self.estimate(x_new.row(row), None).unwrap_or(fallback))
            .collect();
        Ok(Array1::from_vec(predictions))
    }

    fn estimate(&self, point: ArrayView1<f64>, exclude: Option<usize>) -> Option<f64> {
        let weights = forest_weights(&self.trees, point, exclude)?;
        let (numerator, denominator) = weights
            .iter()
            .fold((0.0, 0.0), |(num, den), (&row, &w)| (num + w * self.y[row], den + w));
        (denominator > 0.0).then(|| numerator / denominator)
    }
}
