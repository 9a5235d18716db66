use super::EstimatorError;
use serde::{Deserialize, Serialize};

/// Hyperparameters shared by regression and causal forests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    /// Number of trees grown in the forest.
    pub num_trees: usize,
    /// Fraction of the rows drawn (without replacement) for each tree.
    pub sample_fraction: f64,
    /// Number of candidate variables tried at each split. `None` means
    /// `min(ceil(sqrt(p) + 20), p)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtry: Option<usize>,
    /// Target minimum number of growing-sample rows in a leaf.
    pub min_node_size: usize,
    /// Grow the tree structure and estimate leaf values on disjoint halves.
    pub honesty: bool,
    /// Share of each subsample used to place splits when `honesty` is on.
    pub honesty_fraction: f64,
    /// Collapse splits whose children receive no estimation rows.
    pub honesty_prune_leaves: bool,
    /// Minimum share of a node's rows that each child must keep.
    pub alpha: f64,
    /// Penalty subtracted from a split's gain for unbalanced children.
    pub imbalance_penalty: f64,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            num_trees: 2000,
            sample_fraction: 0.5,
            mtry: None,
            min_node_size: 5,
            honesty: true,
            honesty_fraction: 0.5,
            honesty_prune_leaves: true,
            alpha: 0.05,
            imbalance_penalty: 0.0,
            seed: 42,
        }
    }
}

impl ForestParams {
    pub fn resolved_mtry(&self, num_features: usize) -> usize {
        self.mtry.unwrap_or_else(|| {
            let default = ((num_features as f64).sqrt() + 20.0).ceil() as usize;
            default.min(num_features)
        })
    }

    /// Parameters for the auxiliary forests that estimate `Y.hat` and `W.hat`
    /// when the caller does not supply them.
    pub fn nuisance(&self) -> Self {
        Self {
            num_trees: (self.num_trees / 4).max(50),
            ..self.clone()
        }
    }

    /// Number of rows drawn for each tree out of `n`.
    pub fn subsample_size(&self, n: usize) -> usize {
        ((n as f64) * self.sample_fraction).ceil() as usize
    }

    pub fn validate(&self, n: usize, num_features: usize) -> Result<(), EstimatorError> {
        fn invalid(name: &'static str, reason: String) -> EstimatorError {
            EstimatorError::InvalidParameter { name, reason }
        }

        if self.num_trees == 0 {
            return Err(invalid("num_trees", "must be at least 1".to_string()));
        }
        if !(self.sample_fraction > 0.0 && self.sample_fraction <= 1.0) {
            return Err(invalid(
                "sample_fraction",
                format!("{} is outside (0, 1]", self.sample_fraction),
            ));
        }
        if num_features == 0 {
            return Err(invalid("mtry", "the covariate matrix has no columns".to_string()));
        }
        let mtry = self.resolved_mtry(num_features);
        if mtry == 0 || mtry > num_features {
            return Err(invalid(
                "mtry",
                format!("{mtry} is outside 1..={num_features}"),
            ));
        }
        if self.min_node_size == 0 {
            return Err(invalid("min_node_size", "must be at least 1".to_string()));
        }
        if !(self.honesty_fraction > 0.0 && self.honesty_fraction < 1.0) {
            return Err(invalid(
                "honesty_fraction",
                format!("{} is outside (0, 1)", self.honesty_fraction),
            ));
        }
        if !(0.0..0.5).contains(&self.alpha) {
            return Err(invalid("alpha", format!("{} is outside [0, 0.5)", self.alpha)));
        }
        if !(self.imbalance_penalty >= 0.0 && self.imbalance_penalty.is_finite()) {
            return Err(invalid(
                "imbalance_penalty",
                format!("{} must be finite and non-negative", self.imbalance_penalty),
            ));
        }

        let drawn = self.subsample_size(n);
        let needed = if self.honesty { 4 } else { 2 };
        if drawn < needed {
            return Err(EstimatorError::TooFewRows {
                rows: n,
                sample_fraction: self.sample_fraction,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mtry_is_capped_by_feature_count() {
        let params = ForestParams::default();
        assert_eq!(params.resolved_mtry(4), 4);
        assert_eq!(params.resolved_mtry(900), 50);
    }

    #[test]
    fn sample_fraction_must_be_a_fraction() {
        let params = ForestParams {
            sample_fraction: 1.5,
            ..ForestParams::default()
        };
        let err = params.validate(100, 3).unwrap_err();
        assert!(matches!(
            err,
            EstimatorError::InvalidParameter {
                name: "sample_fraction",
                ..
            }
        ));
    }

    #[test]
    fn tiny_samples_are_rejected() {
        let err = ForestParams::default().validate(5, 2).unwrap_err();
        assert!(matches!(err, EstimatorError::TooFewRows { rows: 5, .. }));
    }

    #[test]
    fn params_round_trip_through_toml_with_defaults() {
        let parsed: ForestParams = toml::from_str("num_trees = 300\nmtry = 2").unwrap();
        assert_eq!(parsed.num_trees, 300);
        assert_eq!(parsed.mtry, Some(2));
        assert_eq!(parsed.min_node_size, 5);
    }
}
