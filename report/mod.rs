//! # Diagnostics Reporter
//!
//! Turns a fitted effect model into the artifacts of an analysis: summary
//! tables, a CATE histogram, the policy tree, one tree of the forest and a widened copy of the input
//! table with each row's CATE. The model is only queried, never changed.

pub mod svg;
pub mod tables;

use crate::adapter::{EffectModel, FittedEffectModel};
use crate::data::{ObservationTable, TableError};
use crate::forest::EstimatorError;
use crate::forest::inference::{self, AverageEffect, CalibrationTest, TargetSample};
use crate::forest::params::ForestParams;
use crate::forest::stats::Coefficient;
use crate::matrix::{self, DesignMatrix};
use crate::policy::{PolicyNode, PolicyTree};
use crate::rows::{AlignmentError, RowAligned};
use log::{info, warn};
use ndarray::{Array1, ArrayView1};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tables::{BalanceRow, QuintileRow, Table};
use thiserror::Error;

pub const CATE_COLUMN: &str = "cate";
pub const QUINTILE_COLUMN: &str = "cate_quintile";
const ARMS: [&str; 2] = ["control", "treated"];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to serialize run summary to TOML: {0}")]
    Toml(#[from] toml::ser::Error),
    #[error("Diagnostics could not be computed: {0}")]
    Estimator(#[from] EstimatorError),
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Copy)]
pub struct ReportSettings {
    pub policy_depth: usize,
    pub policy_split_step: usize,
    pub histogram_bins: usize,
    pub forest_tree_index: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            policy_depth: 2,
            policy_split_step: 1,
            histogram_bins: 30,
            forest_tree_index: 0,
        }
    }
}

/// Every diagnostic produced for one fitted model.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub rows: usize,
    pub cate: RowAligned<Array1<f64>>,
    /// `None` when the forest predicts a constant effect.
    pub calibration: Option<CalibrationTest>,
    pub average_effects: Vec<(TargetSample, AverageEffect)>,
    pub quintiles: Vec<QuintileRow>,
    pub balance: Vec<BalanceRow>,
    pub projection: Vec<(String, Coefficient)>,
    pub importance: Vec<(String, f64)>,
    pub policy: PolicyTree,
    pub tuned_params: Option<ForestParams>,
    pub predictions: ObservationTable,
    pub histogram_svg: String,
    pub policy_svg: String,
    pub policy_text: String,
    pub forest_tree_svg: String,
    pub forest_tree_text: String,
}

impl DiagnosticsReport {
    pub fn build<M: EffectModel>(
        table: &ObservationTable,
        x: &DesignMatrix,
        fitted: &FittedEffectModel<M>,
        settings: &ReportSettings,
    ) -> Result<Self, ReportError> {
        let cate = fitted.predict()?;
        table.ids().ensure_matches(cate.ids(), "CATE predictions")?;
        x.ids().ensure_matches(cate.ids(), "covariate matrix")?;
        let quintile_ids = matrix::ntile(&cate, 5)?;
        let predictions = table
            .with_f64_column(CATE_COLUMN, &cate)?
            .with_u32_column(QUINTILE_COLUMN, &quintile_ids)?;

        let calibration = match fitted.calibration_test() {
            Ok(test) => Some(test),
            Err(EstimatorError::DegenerateDesign(reason)) => {
                warn!("Skipping the calibration test: {reason}");
                None
            }
            Err(error) => return Err(error.into()),
        };

        let average_effects = TargetSample::ALL
            .iter()
            .map(|&target| {
                fitted
                    .average_treatment_effect(target)
                    .map(|effect| (target, effect))
            })
            .collect::<Result<Vec<_>, EstimatorError>>()?;

        let scores = fitted.cate_scores()?;
        let groups = quintile_ids.values();
        let effects = inference::group_effects(scores.view(), groups, 5)?;
        let quintiles = effects
            .into_iter()
            .zip(1u32..)
            .map(|(effect, quintile)| {
                let members: Vec<f64> = groups
                    .iter()
                    .zip(cate.values())
                    .filter(|(g, _)| **g == quintile)
                    .map(|(_, c)| *c)
                    .collect();
                QuintileRow {
                    quintile,
                    rows: members.len(),
                    mean_cate: mean(&members),
                    effect,
                }
            })
            .collect();

        let balance = x
            .names()
            .iter()
            .enumerate()
            .map(|(j, name)| balance_row(name, x.view().column(j), groups))
            .collect();

        let projection = match inference::best_linear_projection(scores.view(), x.view()) {
            Ok(coefficients) => std::iter::once("(Intercept)".to_string())
                .chain(x.names().iter().cloned())
                .zip(coefficients)
                .collect(),
            Err(error @ (EstimatorError::SingularDesign(_) | EstimatorError::DegenerateDesign(_))) => {
                warn!("Skipping the best linear projection: {error}");
                Vec::new()
            }
            Err(error) => return Err(error.into()),
        };

        let rewards = fitted.double_robust_scores()?;
        let policy = PolicyTree::fit(
            x.view(),
            rewards.view(),
            settings.policy_depth,
            settings.policy_split_step,
        )?;
        info!(
            "Policy tree of depth {} has {} leaves",
            policy.depth(),
            policy.leaves().len()
        );

        let histogram_svg = svg::histogram(
            &cate.values().to_vec(),
            settings.histogram_bins,
            "Out-of-bag CATE estimates",
            "estimated CATE",
        );
        let policy_svg = svg::policy_tree(&policy, x.names(), &ARMS);
        let policy_text = policy.describe(x.names(), &ARMS);

        let index = settings.forest_tree_index;
        let tree = fitted.tree(index)?;
        let forest_tree_svg = svg::forest_tree(tree, fitted.covariate_names(), index);
        let forest_tree_text = format!(
            "Forest tree {index} ({} leaves, {} rows drawn)\n{}",
            tree.num_leaves(),
            tree.drawn().len(),
            tree.describe(fitted.covariate_names())
        );

        Ok(Self {
            rows: cate.len(),
            cate,
            calibration,
            average_effects,
            quintiles,
            balance,
            projection,
            importance: fitted.variable_importance(),
            policy,
            tuned_params: fitted.tuning().map(|t| t.params.clone()),
            predictions,
            histogram_svg,
            policy_svg,
            policy_text,
            forest_tree_svg,
            forest_tree_text,
        })
    }

    pub fn tables(&self) -> Vec<(&'static str, Table)> {
        let mut out = Vec::new();
        if let Some(test) = &self.calibration {
            out.push(("calibration", tables::calibration(test)));
        }
        out.push(("average_effects", tables::average_effects(&self.average_effects)));
        out.push(("cate_quintiles", tables::quintiles(&self.quintiles)));
        out.push(("balance", tables::balance(&self.balance)));
        if !self.projection.is_empty() {
            out.push(("best_linear_projection", tables::projection(&self.projection)));
        }
        out.push(("variable_importance", tables::importance(&self.importance)));
        out
    }

    /// Prints every table and the policy tree to stdout.
    pub fn print(&self) {
        for (_, table) in self.tables() {
            println!("{}", table.render());
        }
        println!("{}", self.policy_text);
    }

    /// Writes every artifact into `dir`, creating it when needed, and returns
    /// the paths written.
    pub fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for (stem, table) in self.tables() {
            let path = dir.join(format!("{stem}.tsv"));
            table.write_tsv(&path)?;
            written.push(path);
        }

        let artifacts = [
            ("cate_histogram.svg", &self.histogram_svg),
            ("policy_tree.svg", &self.policy_svg),
            ("policy_tree.txt", &self.policy_text),
            ("forest_tree.svg", &self.forest_tree_svg),
            ("forest_tree.txt", &self.forest_tree_text),
        ];
        for (name, content) in artifacts {
            let path = dir.join(name);
            fs::write(&path, content)?;
            written.push(path);
        }

        let path = dir.join("predictions.tsv");
        self.predictions.write_tsv(&path)?;
        written.push(path);

        let path = dir.join("summary.toml");
        fs::write(&path, toml::to_string_pretty(&self.summary())?)?;
        written.push(path);

        info!("Wrote {} report files to '{}'", written.len(), dir.display());
        Ok(written)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            rows: self.rows,
            mean_cate: mean(&self.cate.values().to_vec()),
            average_effects: self
                .average_effects
                .iter()
                .map(|(target, effect)| EffectEntry {
                    target: *target,
                    estimate: effect.estimate,
                    std_error: effect.std_error,
                })
                .collect(),
            calibration: self.calibration,
            tuned_params: self.tuned_params.clone(),
            policy: self.policy.root().clone(),
        }
    }
}

/// Machine-readable digest of a run, written as `summary.toml`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub rows: usize,
    pub mean_cate: f64,
    pub average_effects: Vec<EffectEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationTest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuned_params: Option<ForestParams>,
    pub policy: PolicyNode,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EffectEntry {
    pub target: TargetSample,
    pub estimate: f64,
    pub std_error: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Compares a covariate between the bottom (1) and top (5) CATE quintiles.
fn balance_row(name: &str, column: ArrayView1<f64>, groups: &[u32]) -> BalanceRow {
    let pick = |quintile: u32| -> Vec<f64> {
        column
            .iter()
            .zip(groups)
            .filter(|(_, g)| **g == quintile)
            .map(|(v, _)| *v)
            .collect()
    };
    let low = pick(1);
    let high = pick(5);
    let mean_low = mean(&low);
    let mean_high = mean(&high);
    let difference = mean_high - mean_low;
    let pooled = ((variance(&low) + variance(&high)) / 2.0).sqrt();
    BalanceRow {
        covariate: name.to_string(),
        mean_low,
        mean_high,
        difference,
        std_difference: if pooled > 0.0 { difference / pooled } else { f64::NAN },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn balance_compares_extreme_quintiles() {
        let column = array![0.0, 1.0, 5.0, 5.0, 2.0, 3.0];
        let groups = [1, 1, 3, 3, 5, 5];
        let row = balance_row("par_inc", column.view(), &groups);
        assert_abs_diff_eq!(row.mean_low, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(row.mean_high, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(row.difference, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(row.std_difference, 2.0 / 0.5f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn constant_covariate_has_no_standardized_difference() {
        let column = array![1.0, 1.0, 1.0, 1.0];
        let row = balance_row("female", column.view(), &[1, 1, 5, 5]);
        assert_eq!(row.difference, 0.0);
        assert!(row.std_difference.is_nan());
    }
}
