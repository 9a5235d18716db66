//! # Analysis Pipeline
//!
//! One linear pass: load, extract, optionally orthogonalize, fit, report.
//! Every stage returns a new value and any failure ends the run. Column
//! requirements are checked against the table before any forest is grown.

use crate::adapter::{AdapterError, ForestBackend, ForestEstimatorAdapter};
use crate::config::{ConfigError, RunConfig};
use crate::data::{LoadError, ObservationTable, TableError, load_table};
use crate::forest::EstimatorError;
use crate::matrix::{SchemaError, extract, extract_vector};
use crate::report::{DiagnosticsReport, ReportError, ReportSettings};
use crate::residualize::orthogonalize;
use crate::rows::AlignmentError;
use log::info;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to load the dataset: {0}")]
    Load(#[from] LoadError),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    DimensionMismatch(#[from] AlignmentError),
    #[error("Estimation failed: {0}")]
    Estimator(#[from] EstimatorError),
    #[error("Failed to build the output table: {0}")]
    Table(#[from] TableError),
    #[error("Failed to produce diagnostics: {0}")]
    Report(#[from] ReportError),
}

impl From<AdapterError> for PipelineError {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::Alignment(e) => PipelineError::DimensionMismatch(e),
            AdapterError::Schema(e) => PipelineError::Schema(e),
            AdapterError::Estimator(e) => PipelineError::Estimator(e),
        }
    }
}

pub struct RunOutcome {
    pub report: DiagnosticsReport,
    pub written: Vec<PathBuf>,
}

/// Runs the whole analysis described by `config` and writes its artifacts.
pub fn run(config: &RunConfig) -> Result<RunOutcome, PipelineError> {
    config.validate()?;
    let start = Instant::now();
    let table = load_table(&config.input)?;
    let report = analyze(&table, config)?;
    let written = report.write_to(&config.output_dir)?;
    info!("Analysis finished in {:.2?}", start.elapsed());
    Ok(RunOutcome { report, written })
}

/// Fits the effect model on an already loaded table and builds its diagnostics.
pub fn analyze(
    table: &ObservationTable,
    config: &RunConfig,
) -> Result<DiagnosticsReport, PipelineError> {
    let x = extract(table, &config.covariates)?;
    let y = extract_vector(table, &config.outcome)?;
    let w = extract_vector(table, &config.treatment)?;
    if let Some(missing) = config
        .fixed_effects
        .iter()
        .find(|name| !table.has_column(name))
    {
        return Err(SchemaError::ColumnNotFound(missing.clone()).into());
    }
    println!(
        "Extracted {} rows: outcome '{}', treatment '{}', {} covariates",
        x.nrows(),
        config.outcome,
        config.treatment,
        x.ncols()
    );

    let nuisance = if config.fixed_effects.is_empty() {
        None
    } else {
        println!(
            "Orthogonalizing on fixed effects: {}",
            config.fixed_effects.join(", ")
        );
        Some(orthogonalize(
            table,
            &config.fixed_effects,
            &config.outcome,
            &config.treatment,
            &config.forest,
        )?)
    };

    let backend = ForestBackend {
        params: config.forest.clone(),
        tuning: config.tune.then_some(config.tuning),
    };
    println!(
        "Fitting causal forest with {} trees{}",
        config.forest.num_trees,
        if config.tune { " after tuning" } else { "" }
    );
    let fitted = ForestEstimatorAdapter::new(backend).fit(&x, &y, &w, nuisance.as_ref())?;
    if let Some(tuning) = fitted.tuning() {
        println!(
            "Tuning chose R-loss {:.6} (defaults {:.6}) after {} candidates",
            tuning.loss, tuning.default_loss, tuning.candidates_evaluated
        );
    }

    let settings = ReportSettings {
        policy_depth: config.policy_depth,
        policy_split_step: config.policy_split_step,
        histogram_bins: config.histogram_bins,
        forest_tree_index: config.forest_tree_index,
    };
    Ok(DiagnosticsReport::build(table, &x, &fitted, &settings)?)
}
