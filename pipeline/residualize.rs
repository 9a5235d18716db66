//! # Residualization
//!
//! Estimates the nuisance functions `E[Y | X_orth]` and `E[W | X_orth]` with
//! regression forests, where `X_orth` is a design of fixed-effect indicators.
//! The out-of-bag predictions are handed to the adapter so the causal forest
//! runs in orthogonalized mode.

use crate::adapter::AdapterError;
use crate::data::ObservationTable;
use crate::forest::EstimatorError;
use crate::forest::params::ForestParams;
use crate::forest::regression::RegressionForest;
use crate::matrix::{self, DesignMatrix};
use crate::rows::RowAligned;
use log::info;
use ndarray::Array1;

/// Out-of-bag nuisance predictions, aligned with the table they came from.
#[derive(Debug, Clone)]
pub struct Nuisance {
    pub y_hat: RowAligned<Array1<f64>>,
    pub w_hat: RowAligned<Array1<f64>>,
}

/// Fits a regression forest of `target` on `x_orth` and returns its in-sample
/// out-of-bag predictions.
pub fn residualize(
    x_orth: &DesignMatrix,
    target: &RowAligned<Array1<f64>>,
    params: &ForestParams,
) -> Result<RowAligned<Array1<f64>>, AdapterError> {
    x_orth
        .ids()
        .ensure_matches(target.ids(), "residualization target")?;
    if x_orth.ncols() == 0 {
        return Err(EstimatorError::Shape(
            "the orthogonalization design has no columns".to_string(),
        )
        .into());
    }
    let forest = RegressionForest::fit(x_orth.view(), target.view(), params)?;
    Ok(RowAligned::new(
        x_orth.ids().clone(),
        forest.predict_oob(),
        "out-of-bag predictions",
    )?)
}

/// Builds `X_orth` from dummy-encoded `fixed_effects` and estimates `Y.hat` and
/// `W.hat` on it. The raw fixed-effect columns never enter the design.
pub fn orthogonalize<S: AsRef<str>>(
    table: &ObservationTable,
    fixed_effects: &[S],
    outcome: &str,
    treatment: &str,
    params: &ForestParams,
) -> Result<Nuisance, AdapterError> {
    let encoding = matrix::dummy_encode(table, fixed_effects)?;
    if encoding.names.is_empty() {
        return Err(EstimatorError::Shape(
            "no fixed effects were given, so the orthogonalization design has no columns"
                .to_string(),
        )
        .into());
    }
    let x_orth = matrix::extract(&encoding.table, &encoding.names)?;
    let y = matrix::extract_vector(table, outcome)?;
    let w = matrix::extract_vector(table, treatment)?;
    info!(
        "Orthogonalizing on {} fixed-effect indicators",
        x_orth.ncols()
    );

    let params = params.nuisance();
    Ok(Nuisance {
        y_hat: residualize(&x_orth, &y, &params)?,
        w_hat: residualize(&x_orth, &w, &params)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::AlignmentError;
    use approx::assert_abs_diff_eq;
    use polars::prelude::*;

    fn panel(n: usize) -> ObservationTable {
        let state: Vec<String> = (0..n).map(|i| format!("s{}", i % 3)).collect();
        let w: Vec<f64> = (0..n).map(|i| if i % 3 == 0 { (i % 2) as f64 } else { ((i / 3) % 4 == 0) as u8 as f64 }).collect();
        let y: Vec<f64> = (0..n).map(|i| (i % 3) as f64 * 2.0 + w[i]).collect();
        ObservationTable::from_frame(df!("fe_state" => state, "w" => w, "y" => y).unwrap()).unwrap()
    }

    #[test]
    fn nuisance_vectors_are_row_aligned() {
        let table = panel(300);
        let params = ForestParams {
            num_trees: 200,
            ..ForestParams::default()
        };
        let nuisance = orthogonalize(&table, &["fe_state"], "y", "w", &params).unwrap();
        assert_eq!(nuisance.y_hat.ids(), table.ids());
        assert_eq!(nuisance.w_hat.len(), 300);
        // Rows in state s2 have outcome mean close to 4 plus the treated share.
        let mean_s2: f64 = (0..300)
            .filter(|i| i % 3 == 2)
            .map(|i| nuisance.y_hat.values()[i])
            .sum::<f64>()
            / 100.0;
        assert_abs_diff_eq!(mean_s2, 4.25, epsilon = 0.3);
    }

    #[test]
    fn empty_fixed_effects_are_an_estimator_error() {
        let table = panel(30);
        let err = orthogonalize::<&str>(&table, &[], "y", "w", &ForestParams::default()).unwrap_err();
        assert!(matches!(err, AdapterError::Estimator(_)));
    }

    #[test]
    fn misaligned_target_is_rejected() {
        let table = panel(60);
        let encoding = matrix::dummy_encode(&table, &["fe_state"]).unwrap();
        let x_orth = matrix::extract(&encoding.table, &encoding.names).unwrap();
        let other = ObservationTable::from_frame(table.frame().head(Some(50))).unwrap();
        let target = matrix::extract_vector(&other, "y").unwrap();
        let err = residualize(&x_orth, &target, &ForestParams::default()).unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Alignment(AlignmentError::DimensionMismatch { .. })
        ));
    }
}
