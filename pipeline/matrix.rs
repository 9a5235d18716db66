//! # Matrix Extraction
//!
//! Projects named columns of an `ObservationTable` into dense `ndarray`
//! structures for the estimators. Projection is pure: the table is never
//! modified, and every extracted matrix carries the table's row identifiers.
//!
//! - Column lists are explicit and must be free of duplicates. A repeated name
//!   almost always means a copy-paste slip in the caller's covariate list, so it
//!   is reported instead of being silently collapsed.
//! - Every value must be numeric, present and finite; the estimators cannot
//!   work with anything else.

use crate::data::{ObservationTable, TableError};
use crate::rows::{AlignmentError, RowAligned, RowIds};
use ahash::AHashSet;
use itertools::Itertools;
use log::debug;
use natord::compare;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use polars::prelude::*;
use thiserror::Error;

/// Errors raised when requested columns do not fit the numeric schema.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error(
        "The required column '{0}' was not found in the input table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("The column '{0}' was requested more than once.")]
    DuplicateColumn(String),
    #[error("No columns were requested.")]
    EmptySelection,
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
}

/// A dense numeric matrix with named columns and row identity.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    names: Vec<String>,
    data: RowAligned<Array2<f64>>,
}

impl DesignMatrix {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn ids(&self) -> &RowIds {
        self.data.ids()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn nrows(&self) -> usize {
        self.data.values().nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.values().ncols()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.names
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| self.data.values().column(index))
    }
}

/// Result of dummy-encoding categorical columns.
#[derive(Debug, Clone)]
pub struct DummyEncoding {
    /// The input table widened with one indicator column per category level.
    pub table: ObservationTable,
    /// Names of the indicator columns, grouped by source column, levels in natural order.
    pub names: Vec<String>,
}

/// Extracts `names` as a matrix with one column per name, in the order given.
pub fn extract<S: AsRef<str>>(
    table: &ObservationTable,
    names: &[S],
) -> Result<DesignMatrix, SchemaError> {
    if names.is_empty() {
        return Err(SchemaError::EmptySelection);
    }
    let mut seen = AHashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_ref()) {
            return Err(SchemaError::DuplicateColumn(name.as_ref().to_string()));
        }
    }
    // Validate presence of every column before converting any of them.
    for name in names {
        if !table.has_column(name.as_ref()) {
            return Err(SchemaError::ColumnNotFound(name.as_ref().to_string()));
        }
    }

    let n = table.height();
    let mut matrix = Array2::<f64>::zeros((n, names.len()));
    for (j, name) in names.iter().enumerate() {
        let values = Array1::from_vec(numeric_column(table.frame(), name.as_ref())?);
        matrix.column_mut(j).assign(&values);
    }
    let data = RowAligned::new(table.ids().clone(), matrix, "design matrix")?;

    debug!(
        "Extracted {}x{} matrix: {:?}",
        n,
        names.len(),
        names.iter().map(AsRef::as_ref).collect_vec()
    );
    Ok(DesignMatrix {
        names: names.iter().map(|name| name.as_ref().to_string()).collect(),
        data,
    })
}

/// Extracts a single column as a row-aligned vector (used for `W` and `Y`).
pub fn extract_vector(
    table: &ObservationTable,
    name: &str,
) -> Result<RowAligned<Array1<f64>>, SchemaError> {
    if !table.has_column(name) {
        return Err(SchemaError::ColumnNotFound(name.to_string()));
    }
    let values = Array1::from_vec(numeric_column(table.frame(), name)?);
    Ok(RowAligned::new(table.ids().clone(), values, name)?)
}

/// Adds one 0/1 indicator column per observed level of each categorical column.
///
/// Indicator columns are named `<column>_<level>`. The raw category columns stay
/// in the table but are never listed in `DummyEncoding::names`.
pub fn dummy_encode<S: AsRef<str>>(
    table: &ObservationTable,
    category_columns: &[S],
) -> Result<DummyEncoding, SchemaError> {
    let mut columns = Vec::new();
    let mut names = Vec::new();
    for source in category_columns {
        let source = source.as_ref();
        if !table.has_column(source) {
            return Err(SchemaError::ColumnNotFound(source.to_string()));
        }
        let labels = category_labels(table.frame(), source)?;
        let levels: Vec<&str> = labels
            .iter()
            .map(String::as_str)
            .unique()
            .sorted_by(|a, b| compare(a, b))
            .collect();
        debug!("Column '{source}' has {} levels", levels.len());

        for level in levels {
            let name = format!("{source}_{level}");
            let indicator: Vec<f64> = labels
                .iter()
                .map(|label| if label == level { 1.0 } else { 0.0 })
                .collect();
            columns.push(Column::new(name.as_str().into(), indicator));
            names.push(name);
        }
    }
    let table = table.with_derived_columns(columns)?;
    Ok(DummyEncoding { table, names })
}

/// Assigns each value to one of `k` equally sized buckets by rank, numbered
/// `1..=k` from lowest to highest. Ties are broken by row position.
pub fn ntile(
    values: &RowAligned<Array1<f64>>,
    k: usize,
) -> Result<RowAligned<Vec<u32>>, AlignmentError> {
    let n = values.len();
    let k = k.max(1);
    let order: Vec<usize> = (0..n)
        .sorted_by(|&a, &b| values.values()[a].total_cmp(&values.values()[b]))
        .collect();
    let mut buckets = vec![0u32; n];
    for (rank, &row) in order.iter().enumerate() {
        buckets[row] = (rank * k / n.max(1)) as u32 + 1;
    }
    RowAligned::new(values.ids().clone(), buckets, "quantile buckets")
}

fn numeric_column(frame: &DataFrame, column_name: &str) -> Result<Vec<f64>, SchemaError> {
    let series = frame.column(column_name)?;
    if series.null_count() > 0 {
        return Err(SchemaError::MissingValuesFound(column_name.to_string()));
    }

    let wrong_type = || SchemaError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", series.dtype()),
    };
    if matches!(series.dtype(), DataType::String) {
        return Err(wrong_type());
    }
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SchemaError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn category_labels(frame: &DataFrame, column_name: &str) -> Result<Vec<String>, SchemaError> {
    let series = frame.column(column_name)?;
    if series.null_count() > 0 {
        return Err(SchemaError::MissingValuesFound(column_name.to_string()));
    }
    let casted = series
        .cast(&DataType::String)
        .map_err(|_| SchemaError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "categorical (string)",
            found_type: format!("{:?}", series.dtype()),
        })?;
    let labels = casted
        .str()?
        .into_iter()
        .map(|label| label.unwrap_or_default().to_string())
        .collect();
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn table() -> ObservationTable {
        let frame = df!(
            "y" => &[1.0, 2.0, 3.0, 4.0],
            "Treatment" => &[0i64, 1, 0, 1],
            "female" => &[1i64, 0, 0, 1],
            "par_inc" => &[10.5, 20.0, 30.5, 40.0],
            "fe_state" => &["s10", "s2", "s10", "s1"],
            "note" => &["a", "b", "c", "d"]
        )
        .unwrap();
        ObservationTable::from_frame(frame).unwrap()
    }

    #[test]
    fn extracts_columns_in_requested_order() {
        let table = table();
        let x = extract(&table, &["par_inc", "female"]).unwrap();
        assert_eq!(x.nrows(), table.height());
        assert_eq!(x.ncols(), 2);
        assert_eq!(x.names(), &["par_inc".to_string(), "female".to_string()]);
        assert_abs_diff_eq!(x.view()[[2, 0]], 30.5);
        assert_abs_diff_eq!(x.view()[[3, 1]], 1.0);
        assert_eq!(x.ids(), table.ids());
    }

    #[test]
    fn absent_column_is_a_schema_error() {
        let err = extract(&table(), &["female", "nonexistent_var"]).unwrap_err();
        match err {
            SchemaError::ColumnNotFound(name) => assert_eq!(name, "nonexistent_var"),
            other => panic!("expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_covariate_is_rejected() {
        let err = extract(&table(), &["female", "par_inc", "female"]).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateColumn(name) if name == "female"));
    }

    #[test]
    fn text_column_is_not_numeric() {
        let err = extract_vector(&table(), "note").unwrap_err();
        assert!(matches!(err, SchemaError::ColumnWrongType { .. }));
    }

    #[test]
    fn dummies_use_natural_level_order() {
        let encoded = dummy_encode(&table(), &["fe_state"]).unwrap();
        assert_eq!(
            encoded.names,
            vec!["fe_state_s1", "fe_state_s2", "fe_state_s10"]
        );
        let x = extract(&encoded.table, &encoded.names).unwrap();
        assert_eq!(x.nrows(), 4);
        for row in x.view().rows() {
            assert_abs_diff_eq!(row.sum(), 1.0);
        }
        assert_abs_diff_eq!(x.column("fe_state_s10").unwrap()[0], 1.0);
    }

    #[test]
    fn ntile_splits_ranks_evenly() {
        let values = RowAligned::new(
            RowIds::sequential(10),
            Array1::from_iter((0..10).rev().map(|v| v as f64)),
            "cate",
        )
        .unwrap();
        let buckets = ntile(&values, 5).unwrap();
        assert_eq!(buckets.values(), &vec![5, 5, 4, 4, 3, 3, 2, 2, 1, 1]);
    }
}
