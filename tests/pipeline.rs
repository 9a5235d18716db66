mod common;

use grove::adapter::{ForestBackend, ForestEstimatorAdapter};
use grove::config::RunConfig;
use grove::data::ObservationTable;
use grove::forest::params::ForestParams;
use grove::matrix::{SchemaError, extract, extract_vector};
use grove::report::{CATE_COLUMN, QUINTILE_COLUMN};
use grove::rows::AlignmentError;
use grove::run::{PipelineError, analyze, run};
use tempfile::tempdir;

fn quick_config() -> RunConfig {
    RunConfig {
        forest: ForestParams {
            num_trees: 200,
            ..ForestParams::default()
        },
        ..RunConfig::default()
    }
}

#[test]
fn thousand_rows_give_thousand_finite_cates() {
    let table = ObservationTable::from_frame(common::synthetic_trial(1000, 1)).unwrap();
    let config = quick_config();
    let x = extract(&table, &config.covariates).unwrap();
    let y = extract_vector(&table, "y").unwrap();
    let w = extract_vector(&table, "Treatment").unwrap();
    assert_eq!(x.nrows(), table.height());

    let adapter = ForestEstimatorAdapter::new(ForestBackend {
        params: config.forest.clone(),
        tuning: None,
    });
    let fitted = adapter.fit(&x, &y, &w, None).unwrap();
    let cate = fitted.predict().unwrap();
    assert_eq!(cate.len(), 1000);
    assert!(cate.values().iter().all(|v| v.is_finite()));

    let widened = table.with_f64_column("cate", &cate).unwrap();
    assert_eq!(widened.height(), 1000);
    assert_eq!(widened.ids(), table.ids());
    assert_eq!(table.frame().width() + 1, widened.frame().width());
}

#[test]
fn missing_covariate_fails_before_any_fit() {
    let table = ObservationTable::from_frame(common::synthetic_trial(200, 2)).unwrap();
    let mut config = quick_config();
    config.covariates.push("nonexistent_var".to_string());
    // An invalid forest would fail at fit time, so a schema error proves the
    // columns were checked first.
    config.forest.num_trees = 0;
    match analyze(&table, &config) {
        Err(PipelineError::Schema(SchemaError::ColumnNotFound(name))) => {
            assert_eq!(name, "nonexistent_var")
        }
        Err(other) => panic!("expected a schema error, got {other}"),
        Ok(_) => panic!("expected a schema error"),
    }
}

#[test]
fn mismatched_rows_are_a_dimension_mismatch() {
    let full = common::synthetic_trial(300, 3);
    let table = ObservationTable::from_frame(full.clone()).unwrap();
    let short = ObservationTable::from_frame(full.head(Some(250))).unwrap();
    let x = extract(&table, &["female", "par_inc"]).unwrap();
    let y = extract_vector(&table, "y").unwrap();
    let w = extract_vector(&short, "Treatment").unwrap();

    let adapter = ForestEstimatorAdapter::new(ForestBackend::default());
    let err = match adapter.fit(&x, &y, &w, None) {
        Err(err) => PipelineError::from(err),
        Ok(_) => panic!("mismatched inputs must not be fitted"),
    };
    assert!(matches!(
        err,
        PipelineError::DimensionMismatch(AlignmentError::DimensionMismatch {
            expected: 300,
            found: 250,
            ..
        })
    ));
}

#[test]
fn orthogonalized_and_default_modes_cover_every_row() {
    let table = ObservationTable::from_frame(common::synthetic_trial(400, 4)).unwrap();
    let default_mode = analyze(&table, &quick_config()).unwrap();
    let orthogonalized = analyze(
        &table,
        &RunConfig {
            fixed_effects: vec!["fe_state".to_string()],
            ..quick_config()
        },
    )
    .unwrap();
    assert_eq!(default_mode.cate.len(), 400);
    assert_eq!(orthogonalized.cate.len(), 400);
    assert!(orthogonalized.cate.values().iter().all(|v| v.is_finite()));
}

#[test]
fn full_run_writes_every_artifact() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("trial.tsv");
    let mut frame = common::synthetic_trial(500, 5);
    common::write_tsv(&mut frame, &input);

    let config = RunConfig {
        input,
        output_dir: dir.path().join("out"),
        forest_tree_index: 3,
        ..quick_config()
    };
    let outcome = run(&config).unwrap();

    for name in [
        "average_effects.tsv",
        "cate_quintiles.tsv",
        "balance.tsv",
        "variable_importance.tsv",
        "cate_histogram.svg",
        "policy_tree.svg",
        "policy_tree.txt",
        "forest_tree.svg",
        "forest_tree.txt",
        "predictions.tsv",
        "summary.toml",
    ] {
        assert!(config.output_dir.join(name).exists(), "missing {name}");
    }
    assert!(outcome.written.len() >= 11);

    let forest_tree = std::fs::read_to_string(config.output_dir.join("forest_tree.txt")).unwrap();
    assert!(forest_tree.starts_with("Forest tree 3 ("));
    assert!(forest_tree.contains("leaf"));

    let predictions = std::fs::read_to_string(config.output_dir.join("predictions.tsv")).unwrap();
    let mut lines = predictions.lines();
    let header: Vec<&str> = lines.next().unwrap().split('\t').collect();
    assert_eq!(header[0], "row_id");
    assert!(header.contains(&CATE_COLUMN));
    assert!(header.contains(&QUINTILE_COLUMN));
    assert_eq!(lines.count(), 500);

    let summary: toml::Value =
        toml::from_str(&std::fs::read_to_string(config.output_dir.join("summary.toml")).unwrap())
            .unwrap();
    assert_eq!(summary["rows"].as_integer(), Some(500));
    assert_eq!(summary["average_effects"].as_array().map(Vec::len), Some(4));

    // The effect is 1 for men and 3 for women, so about 2 on average.
    let ate = outcome.report.average_effects[0].1;
    assert!((ate.estimate - 2.0).abs() < 0.5, "ate {}", ate.estimate);
}
