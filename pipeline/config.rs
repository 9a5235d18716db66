//! Run configuration, stored as TOML.

use crate::forest::params::ForestParams;
use crate::forest::tune::TuneSettings;
use crate::policy::MAX_POLICY_DEPTH;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything one analysis run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Dataset to analyse (`.csv`, `.tsv`, `.tab` or `.txt`).
    pub input: PathBuf,
    pub outcome: String,
    pub treatment: String,
    /// Covariates for the causal forest, in design-matrix order.
    pub covariates: Vec<String>,
    /// Categorical columns used to build the orthogonalization design. When
    /// empty, the forest estimates its own nuisance functions.
    pub fixed_effects: Vec<String>,
    pub tune: bool,
    pub policy_depth: usize,
    pub policy_split_step: usize,
    pub histogram_bins: usize,
    /// Which tree of the fitted forest to print and draw.
    pub forest_tree_index: usize,
    pub output_dir: PathBuf,
    pub forest: ForestParams,
    pub tuning: TuneSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("data.tsv"),
            outcome: "y".to_string(),
            treatment: "Treatment".to_string(),
            covariates: ["female", "par_inc", "par_sch", "native"]
                .into_iter()
                .map(String::from)
                .collect(),
            fixed_effects: Vec::new(),
            tune: false,
            policy_depth: 2,
            policy_split_step: 1,
            histogram_bins: 30,
            forest_tree_index: 0,
            output_dir: PathBuf::from("grove_output"),
            forest: ForestParams::default(),
            tuning: TuneSettings::default(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Checks the parts of the configuration that do not depend on the data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outcome.is_empty() || self.treatment.is_empty() {
            return Err(ConfigError::Invalid(
                "outcome and treatment column names must not be empty".to_string(),
            ));
        }
        if self.outcome == self.treatment {
            return Err(ConfigError::Invalid(format!(
                "'{}' cannot be both the outcome and the treatment",
                self.outcome
            )));
        }
        if self.covariates.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one covariate is required".to_string(),
            ));
        }
        let mut seen = AHashSet::new();
        for name in &self.covariates {
            if name.is_empty() {
                return Err(ConfigError::Invalid("empty covariate name".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "covariate '{name}' is listed more than once"
                )));
            }
        }
        let mut seen_fe = AHashSet::new();
        for name in &self.fixed_effects {
            if !seen_fe.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "fixed effect '{name}' is listed more than once"
                )));
            }
            if seen.contains(name.as_str()) || *name == self.outcome || *name == self.treatment {
                return Err(ConfigError::Invalid(format!(
                    "fixed effect '{name}' is also a covariate, the outcome or the treatment"
                )));
            }
        }
        for role in [&self.outcome, &self.treatment] {
            if seen.contains(role.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "'{role}' cannot be both a covariate and the outcome or treatment"
                )));
            }
        }
        if self.histogram_bins == 0 {
            return Err(ConfigError::Invalid(
                "histogram_bins must be at least 1".to_string(),
            ));
        }
        if self.policy_depth > MAX_POLICY_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "policy_depth {} exceeds the maximum of {MAX_POLICY_DEPTH}; the exhaustive search grows exponentially with depth",
                self.policy_depth
            )));
        }
        if self.forest_tree_index >= self.forest.num_trees {
            return Err(ConfigError::Invalid(format!(
                "forest_tree_index {} is out of range for a forest of {} trees",
                self.forest_tree_index, self.forest.num_trees
            )));
        }
        if self.policy_split_step == 0 {
            return Err(ConfigError::Invalid(
                "policy_split_step must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
