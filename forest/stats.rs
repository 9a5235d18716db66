use super::EstimatorError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Inverse;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

/// One row of a coefficient table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coefficient {
    pub estimate: f64,
    pub std_error: f64,
    pub t_value: f64,
    pub p_value: f64,
}

/// Least squares fit with heteroskedasticity-robust (HC3) standard errors.
#[derive(Debug, Clone)]
pub struct OlsFit {
    pub estimates: Array1<f64>,
    pub std_errors: Array1<f64>,
    pub residual_df: usize,
}

impl OlsFit {
    pub fn t_value(&self, index: usize) -> f64 {
        self.estimates[index] / self.std_errors[index]
    }
}

pub fn ols_hc3(design: ArrayView2<f64>, response: ArrayView1<f64>) -> Result<OlsFit, EstimatorError> {
    let (n, k) = design.dim();
    if response.len() != n {
        return Err(EstimatorError::Shape(format!(
            "design has {n} rows but the response has {}",
            response.len()
        )));
    }
    if n <= k {
        return Err(EstimatorError::DegenerateDesign(format!(
            "{n} observations cannot identify {k} coefficients"
        )));
    }

    let xtx = design.t().dot(&design);
    let bread = xtx.inv()?;
    let estimates = bread.dot(&design.t().dot(&response));
    let residuals = &response - &design.dot(&estimates);

    // Leverages h_i = x_i' (X'X)^-1 x_i.
    let projected = design.dot(&bread);
    let leverage: Array1<f64> = (&projected * &design).sum_axis(Axis(1));

    let mut meat = Array2::<f64>::zeros((k, k));
    for (i, row) in design.outer_iter().enumerate() {
        let denom = 1.0 - leverage[i];
        if denom <= 1e-12 {
            return Err(EstimatorError::DegenerateDesign(format!(
                "observation {i} has leverage one"
            )));
        }
        let scale = (residuals[i] / denom).powi(2);
        for a in 0..k {
            for b in 0..k {
                meat[[a, b]] += scale * row[a] * row[b];
            }
        }
    }
    let covariance = bread.dot(&meat).dot(&bread);
    let std_errors = covariance.diag().mapv(|v| v.max(0.0).sqrt());

    Ok(OlsFit {
        estimates,
        std_errors,
        residual_df: n - k,
    })
}

fn students_t(df: usize) -> Result<StudentsT, EstimatorError> {
    StudentsT::new(0.0, 1.0, df as f64).map_err(|e| EstimatorError::Distribution(e.to_string()))
}

/// `P(T > t)` for a Student t with `df` degrees of freedom.
pub fn upper_tail_p(t: f64, df: usize) -> Result<f64, EstimatorError> {
    if t.is_nan() {
        return Ok(f64::NAN);
    }
    Ok(1.0 - students_t(df)?.cdf(t))
}

/// `P(|T| > |t|)` for a Student t with `df` degrees of freedom.
pub fn two_sided_p(t: f64, df: usize) -> Result<f64, EstimatorError> {
    if t.is_nan() {
        return Ok(f64::NAN);
    }
    Ok(2.0 * (1.0 - students_t(df)?.cdf(t.abs())))
}
