//! # Forest Estimator Adapter
//!
//! The only place that hands matrices to an estimation backend. The adapter
//! checks that X, Y, W (and the nuisance vectors, when given) describe the same
//! rows in the same order, calls the backend, and re-attaches the table's row
//! identifiers to everything that comes back.
//!
//! Backends plug in through `CausalEstimator`. They see plain `ndarray` views
//! and never deal with row identity.

use crate::forest::causal::{CausalForest, CausalInputs};
use crate::forest::inference::{AverageEffect, CalibrationTest, TargetSample};
use crate::forest::params::ForestParams;
use crate::forest::tree::Tree;
use crate::forest::tune::{TuneOutcome, TuneSettings};
use crate::forest::EstimatorError;
use crate::matrix::{DesignMatrix, SchemaError};
use crate::residualize::Nuisance;
use crate::rows::{AlignmentError, RowAligned, RowIds};
use log::info;
use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("Estimation failed: {0}")]
    Estimator(#[from] EstimatorError),
}

/// A fitted model together with the tuning result, when tuning ran.
pub struct Fit<M> {
    pub model: M,
    pub tuning: Option<TuneOutcome>,
}

/// An estimation backend that fits heterogeneous treatment effect models.
pub trait CausalEstimator {
    type Model: EffectModel;

    fn fit(&self, inputs: CausalInputs<'_>) -> Result<Fit<Self::Model>, EstimatorError>;
}

/// Queries answered by a fitted effect model. Every per-row output is in the
/// row order of the training inputs.
pub trait EffectModel {
    fn predict(&self) -> Array1<f64>;
    fn calibration_test(&self) -> Result<CalibrationTest, EstimatorError>;
    fn average_effect(&self, target: TargetSample) -> Result<AverageEffect, EstimatorError>;
    /// Per-arm doubly robust rewards, columns (control, treated).
    fn robust_scores(&self) -> Array2<f64>;
    /// Doubly robust scores of the treatment effect itself.
    fn cate_scores(&self) -> Array1<f64>;
    fn variable_importance(&self) -> Vec<f64>;
    /// One fitted tree, by position in the forest.
    fn tree(&self, index: usize) -> Result<&Tree, EstimatorError>;
}

/// The in-crate causal forest backend.
#[derive(Debug, Clone, Default)]
pub struct ForestBackend {
    pub params: ForestParams,
    /// Run random-search tuning before the final fit.
    pub tuning: Option<TuneSettings>,
}

impl CausalEstimator for ForestBackend {
    type Model = CausalForest;

    fn fit(&self, inputs: CausalInputs<'_>) -> Result<Fit<CausalForest>, EstimatorError> {
        match &self.tuning {
            Some(settings) => {
                let (model, outcome) = CausalForest::fit_tuned(inputs, &self.params, settings)?;
                Ok(Fit {
                    model,
                    tuning: Some(outcome),
                })
            }
            None => Ok(Fit {
                model: CausalForest::fit(inputs, &self.params)?,
                tuning: None,
            }),
        }
    }
}

impl EffectModel for CausalForest {
    fn predict(&self) -> Array1<f64> {
        CausalForest::predict(self)
    }

    fn calibration_test(&self) -> Result<CalibrationTest, EstimatorError> {
        self.test_calibration()
    }

    fn average_effect(&self, target: TargetSample) -> Result<AverageEffect, EstimatorError> {
        self.average_treatment_effect(target)
    }

    fn robust_scores(&self) -> Array2<f64> {
        self.double_robust_scores()
    }

    fn cate_scores(&self) -> Array1<f64> {
        self.aipw_scores()
    }

    fn variable_importance(&self) -> Vec<f64> {
        CausalForest::variable_importance(self)
    }

    fn tree(&self, index: usize) -> Result<&Tree, EstimatorError> {
        CausalForest::tree(self, index)
    }
}

pub struct ForestEstimatorAdapter<E = ForestBackend> {
    estimator: E,
}

impl<E: CausalEstimator> ForestEstimatorAdapter<E> {
    pub fn new(estimator: E) -> Self {
        Self { estimator }
    }

    /// Fits the backend on `x`, `y`, `w`. With `nuisance` the fit runs in
    /// orthogonalized mode and `Y.hat`, `W.hat` are passed through unchanged;
    /// without it the backend estimates them itself.
    pub fn fit(
        &self,
        x: &DesignMatrix,
        y: &RowAligned<Array1<f64>>,
        w: &RowAligned<Array1<f64>>,
        nuisance: Option<&Nuisance>,
    ) -> Result<FittedEffectModel<E::Model>, AdapterError> {
        let ids = x.ids();
        ids.ensure_matches(y.ids(), "outcome vector Y")?;
        ids.ensure_matches(w.ids(), "treatment vector W")?;
        if let Some(nuisance) = nuisance {
            ids.ensure_matches(nuisance.y_hat.ids(), "outcome predictions Y.hat")?;
            ids.ensure_matches(nuisance.w_hat.ids(), "propensity predictions W.hat")?;
        }

        info!(
            "Fitting effect model on {} rows with covariates [{}] ({} mode)",
            x.nrows(),
            x.names().join(", "),
            if nuisance.is_some() {
                "orthogonalized"
            } else {
                "unconfoundedness"
            }
        );
        let inputs = CausalInputs {
            x: x.view(),
            y: y.view(),
            w: w.view(),
            y_hat: nuisance.map(|n| n.y_hat.view()),
            w_hat: nuisance.map(|n| n.w_hat.view()),
        };
        let Fit { model, tuning } = self.estimator.fit(inputs)?;
        Ok(FittedEffectModel {
            model,
            ids: ids.clone(),
            covariate_names: x.names().to_vec(),
            tuning,
        })
    }
}

/// A fitted backend model whose outputs carry the training rows' identifiers.
pub struct FittedEffectModel<M> {
    model: M,
    ids: RowIds,
    covariate_names: Vec<String>,
    tuning: Option<TuneOutcome>,
}

impl<M: EffectModel> FittedEffectModel<M> {
    pub fn ids(&self) -> &RowIds {
        &self.ids
    }

    pub fn tuning(&self) -> Option<&TuneOutcome> {
        self.tuning.as_ref()
    }

    /// One CATE per training row.
    pub fn predict(&self) -> Result<RowAligned<Array1<f64>>, AlignmentError> {
        RowAligned::new(self.ids.clone(), self.model.predict(), "CATE predictions")
    }

    pub fn calibration_test(&self) -> Result<CalibrationTest, EstimatorError> {
        self.model.calibration_test()
    }

    pub fn average_treatment_effect(
        &self,
        target: TargetSample,
    ) -> Result<AverageEffect, EstimatorError> {
        self.model.average_effect(target)
    }

    pub fn double_robust_scores(&self) -> Result<RowAligned<Array2<f64>>, AlignmentError> {
        RowAligned::new(self.ids.clone(), self.model.robust_scores(), "doubly robust scores")
    }

    pub fn cate_scores(&self) -> Result<RowAligned<Array1<f64>>, AlignmentError> {
        RowAligned::new(self.ids.clone(), self.model.cate_scores(), "CATE scores")
    }

    /// Importance of each covariate, paired with its name.
    pub fn variable_importance(&self) -> Vec<(String, f64)> {
        self.covariate_names
            .iter()
            .cloned()
            .zip(self.model.variable_importance())
            .collect()
    }

    pub fn tree(&self, index: usize) -> Result<&Tree, EstimatorError> {
        self.model.tree(index)
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ObservationTable;
    use crate::matrix::{extract, extract_vector};
    use polars::prelude::*;

    fn table(n: usize) -> ObservationTable {
        let x1: Vec<f64> = (0..n).map(|i| (i % 10) as f64).collect();
        let x2: Vec<f64> = (0..n).map(|i| ((i * 7) % 13) as f64).collect();
        let w: Vec<f64> = (0..n).map(|i| (i % 2) as f64).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| x1[i] * 0.1 + w[i] * (1.0 + (x1[i] > 4.0) as u8 as f64))
            .collect();
        ObservationTable::from_frame(df!("x1" => x1, "x2" => x2, "w" => w, "y" => y).unwrap())
            .unwrap()
    }

    fn adapter() -> ForestEstimatorAdapter {
        ForestEstimatorAdapter::new(ForestBackend {
            params: ForestParams {
                num_trees: 100,
                ..ForestParams::default()
            },
            tuning: None,
        })
    }

    #[test]
    fn predictions_carry_the_table_row_ids() {
        let table = table(300);
        let x = extract(&table, &["x1", "x2"]).unwrap();
        let y = extract_vector(&table, "y").unwrap();
        let w = extract_vector(&table, "w").unwrap();
        let fitted = adapter().fit(&x, &y, &w, None).unwrap();
        let cate = fitted.predict().unwrap();
        assert_eq!(cate.ids(), table.ids());
        assert_eq!(cate.len(), 300);
        assert!(cate.values().iter().all(|v| v.is_finite()));
        assert_eq!(fitted.variable_importance()[0].0, "x1");
        assert!(fitted.tuning().is_none());
    }

    #[test]
    fn tuned_backend_reports_its_search() {
        let table = table(200);
        let x = extract(&table, &["x1", "x2"]).unwrap();
        let y = extract_vector(&table, "y").unwrap();
        let w = extract_vector(&table, "w").unwrap();
        let adapter = ForestEstimatorAdapter::new(ForestBackend {
            params: ForestParams {
                num_trees: 100,
                ..ForestParams::default()
            },
            tuning: Some(TuneSettings {
                num_draws: 4,
                num_trees: 50,
            }),
        });
        let fitted = adapter.fit(&x, &y, &w, None).unwrap();
        let tuning = fitted.tuning().expect("tuning ran");
        assert_eq!(tuning.params.num_trees, 100);
        assert!(tuning.candidates_evaluated >= 1);
        assert!(tuning.loss.is_finite());
        let cate = fitted.predict().unwrap();
        assert_eq!(cate.len(), 200);
        assert_eq!(cate.ids(), table.ids());
    }

    #[test]
    fn trees_are_reachable_by_index() {
        let table = table(150);
        let x = extract(&table, &["x1", "x2"]).unwrap();
        let y = extract_vector(&table, "y").unwrap();
        let w = extract_vector(&table, "w").unwrap();
        let fitted = adapter().fit(&x, &y, &w, None).unwrap();
        let text = fitted.tree(0).unwrap().describe(fitted.covariate_names());
        assert!(!text.is_empty());
        assert!(matches!(
            fitted.tree(100),
            Err(EstimatorError::TreeIndex {
                index: 100,
                num_trees: 100
            })
        ));
    }

    #[test]
    fn short_treatment_vector_is_a_dimension_mismatch() {
        let table = table(100);
        let short = ObservationTable::from_frame(
            table.frame().head(Some(90)),
        )
        .unwrap();
        let x = extract(&table, &["x1", "x2"]).unwrap();
        let y = extract_vector(&table, "y").unwrap();
        let w = extract_vector(&short, "w").unwrap();
        let err = adapter().fit(&x, &y, &w, None).err().unwrap();
        assert!(matches!(
            err,
            AdapterError::Alignment(AlignmentError::DimensionMismatch {
                expected: 100,
                found: 90,
                ..
            })
        ));
    }
}
