//! # Dataset Loading
//!
//! Entry point for user-provided data. Reads a delimited dataset with `polars`,
//! keeping column names, order, and types exactly as found on disk, and wraps
//! the result in an immutable `ObservationTable` that knows the identity of
//! each of its rows.
//!
//! - No transformation happens at load time. Numeric coercion and validation
//!   belong to the matrix extractor, which reports schema problems per column.
//! - Widening a table (appending CATEs, quintile buckets, dummy columns) always
//!   yields a new table; the original is never mutated.

use crate::rows::{AlignmentError, RowAligned, RowIds};
use ahash::AHashSet;
use log::{debug, info};
use ndarray::Array1;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Name of the optional column holding explicit row identifiers.
pub const ROW_ID_COLUMN: &str = "row_id";

/// Failures while reading a dataset from disk.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Could not open dataset '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error(
        "Unsupported dataset format for '{0}'. Expected a delimited text file ending in .csv, .tsv, .tab or .txt."
    )]
    UnsupportedFormat(String),
    #[error("Dataset '{0}' contains no data rows.")]
    Empty(String),
    #[error("The '{ROW_ID_COLUMN}' column is invalid: {0}")]
    InvalidRowIds(String),
}

/// Failures while widening a table with derived columns.
#[derive(Error, Debug)]
pub enum TableError {
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Column '{0}' already exists in the table.")]
    DuplicateColumn(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An in-memory dataset with one row per individual.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    frame: DataFrame,
    ids: RowIds,
}

/// Reads a delimited dataset from `path`. The separator is chosen from the file
/// extension: `.csv` is comma separated, `.tsv`, `.tab` and `.txt` are tab separated.
pub fn load_table(path: &Path) -> Result<ObservationTable, LoadError> {
    let display = path.display().to_string();
    let separator = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => b',',
        Some("tsv") | Some("tab") | Some("txt") => b'\t',
        _ => return Err(LoadError::UnsupportedFormat(display)),
    };

    info!("Loading dataset from '{display}'");
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: display.clone(),
        source,
    })?;

    let frame = CsvReader::new(file)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(10_000))
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    if frame.height() == 0 {
        return Err(LoadError::Empty(display));
    }

    let table = ObservationTable::from_frame(frame)?;
    info!(
        "Loaded {} rows and {} columns from '{display}'",
        table.height(),
        table.frame.width()
    );
    Ok(table)
}

impl ObservationTable {
    /// Wraps an in-memory frame. Row identifiers come from a `row_id` column when
    /// one exists, otherwise they are the positions `0..n`.
    pub fn from_frame(frame: DataFrame) -> Result<Self, LoadError> {
        let ids = if frame
            .get_column_names()
            .iter()
            .any(|name| name.as_str() == ROW_ID_COLUMN)
        {
            read_row_ids(&frame)?
        } else {
            RowIds::sequential(frame.height())
        };
        Ok(Self { frame, ids })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn ids(&self) -> &RowIds {
        &self.ids
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame
            .get_column_names()
            .iter()
            .any(|column| column.as_str() == name)
    }

    /// Returns a new table with `values` appended as a floating point column.
    pub fn with_f64_column(
        &self,
        name: &str,
        values: &RowAligned<Array1<f64>>,
    ) -> Result<Self, TableError> {
        self.ids.ensure_matches(values.ids(), name)?;
        let column = Column::new(name.into(), values.values().to_vec());
        self.widen(name, column)
    }

    /// Returns a new table with `values` appended as an unsigned integer column.
    pub fn with_u32_column(
        &self,
        name: &str,
        values: &RowAligned<Vec<u32>>,
    ) -> Result<Self, TableError> {
        self.ids.ensure_matches(values.ids(), name)?;
        let column = Column::new(name.into(), values.values().clone());
        self.widen(name, column)
    }

    /// Appends columns computed directly from this table's own rows, such as
    /// dummy indicators. Each column must have exactly one value per row.
    pub fn with_derived_columns(&self, columns: Vec<Column>) -> Result<Self, TableError> {
        let mut frame = self.frame.clone();
        for column in columns {
            let name = column.name().to_string();
            if column.len() != self.height() {
                return Err(AlignmentError::DimensionMismatch {
                    what: name,
                    expected: self.height(),
                    found: column.len(),
                }
                .into());
            }
            if frame
                .get_column_names()
                .iter()
                .any(|existing| existing.as_str() == name)
            {
                return Err(TableError::DuplicateColumn(name));
            }
            frame.with_column(column)?;
        }
        Ok(Self {
            frame,
            ids: self.ids.clone(),
        })
    }

    fn widen(&self, name: &str, column: Column) -> Result<Self, TableError> {
        if self.has_column(name) {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        let mut frame = self.frame.clone();
        frame.with_column(column)?;
        debug!("Widened table with column '{name}' ({} columns)", frame.width());
        Ok(Self {
            frame,
            ids: self.ids.clone(),
        })
    }

    /// Writes the table as TSV with `row_id` as the first column, so every
    /// written row keeps its identity. A table without the column gets one.
    pub fn write_tsv(&self, path: &Path) -> Result<(), TableError> {
        let ids = if self.has_column(ROW_ID_COLUMN) {
            self.frame.column(ROW_ID_COLUMN)?.clone()
        } else {
            Column::new(ROW_ID_COLUMN.into(), self.ids.as_slice().to_vec())
        };
        let mut columns = Vec::with_capacity(self.frame.width() + 1);
        columns.push(ids);
        columns.extend(
            self.frame
                .get_columns()
                .iter()
                .filter(|column| column.name().as_str() != ROW_ID_COLUMN)
                .cloned(),
        );
        let mut frame = DataFrame::new(columns)?;
        let mut file = File::create(path)?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .with_separator(b'\t')
            .finish(&mut frame)?;
        Ok(())
    }
}

fn read_row_ids(frame: &DataFrame) -> Result<RowIds, LoadError> {
    let column = frame.column(ROW_ID_COLUMN)?;
    if column.null_count() > 0 {
        return Err(LoadError::InvalidRowIds("contains missing values".to_string()));
    }
    // Floats would truncate silently, so only integer columns are accepted.
    if !column.dtype().is_integer() {
        return Err(LoadError::InvalidRowIds(format!(
            "non-integer type {:?}",
            column.dtype()
        )));
    }
    let casted = column
        .cast(&DataType::Int64)
        .map_err(|_| LoadError::InvalidRowIds(format!("non-integer type {:?}", column.dtype())))?;
    if casted.null_count() > 0 {
        return Err(LoadError::InvalidRowIds(
            "contains identifiers too large for a 64-bit integer".to_string(),
        ));
    }
    let chunked = casted.i64()?.rechunk();
    let mut seen = AHashSet::with_capacity(frame.height());
    let mut ids = Vec::with_capacity(frame.height());
    for (position, value) in chunked.into_no_null_iter().enumerate() {
        if value < 0 {
            return Err(LoadError::InvalidRowIds(format!(
                "negative identifier {value} at row {}",
                position + 1
            )));
        }
        if !seen.insert(value) {
            return Err(LoadError::InvalidRowIds(format!(
                "duplicate identifier {value} at row {}",
                position + 1
            )));
        }
        ids.push(value as u64);
    }
    Ok(RowIds::from_vec(ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        writeln!(file, "{content}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_tsv_preserving_column_order_and_types() {
        let file = write_temp(
            ".tsv",
            "y\tTreatment\tfe_state\tpar_inc\n1.5\t1\tCA\t30.0\n0.5\t0\tNY\t20.0\n2.0\t1\tCA\t25.0",
        );
        let table = load_table(file.path()).unwrap();
        assert_eq!(table.height(), 3);
        assert_eq!(
            table.column_names(),
            vec!["y", "Treatment", "fe_state", "par_inc"]
        );
        assert_eq!(table.frame().column("fe_state").unwrap().dtype(), &DataType::String);
        assert_eq!(table.ids().as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn loads_csv_with_explicit_row_ids() {
        let file = write_temp(".csv", "row_id,y\n10,1.0\n4,2.0\n7,3.0");
        let table = load_table(file.path()).unwrap();
        assert_eq!(table.ids().as_slice(), &[10, 4, 7]);
    }

    #[test]
    fn duplicate_row_ids_are_rejected() {
        let file = write_temp(".csv", "row_id,y\n1,1.0\n1,2.0");
        match load_table(file.path()) {
            Err(LoadError::InvalidRowIds(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("expected InvalidRowIds, got {other:?}"),
        }
    }

    #[test]
    fn fractional_row_ids_are_rejected() {
        let file = write_temp(".csv", "row_id,y\n0.5,1.0\n1.5,2.0");
        assert!(matches!(
            load_table(file.path()),
            Err(LoadError::InvalidRowIds(_))
        ));

        let frame = df!("row_id" => &[0.0, 1.0], "y" => &[1.0, 2.0]).unwrap();
        assert!(matches!(
            ObservationTable::from_frame(frame),
            Err(LoadError::InvalidRowIds(_))
        ));
    }

    #[test]
    fn written_tables_lead_with_row_id() {
        let frame = df!("y" => &[1.0, 2.0], "row_id" => &[7i64, 3], "x" => &[0.5, 0.25]).unwrap();
        let table = ObservationTable::from_frame(frame).unwrap();
        let out = Builder::new().suffix(".tsv").tempfile().unwrap();
        table.write_tsv(out.path()).unwrap();
        let text = std::fs::read_to_string(out.path()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("row_id\ty\tx"));
        assert!(lines.next().unwrap().starts_with("7\t1"));
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = load_table(Path::new("/definitely/not/here.csv")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = write_temp(".dta", "y\n1.0");
        let err = load_table(file.path()).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn header_only_file_is_empty() {
        let file = write_temp(".csv", "y,Treatment");
        let err = load_table(file.path()).unwrap_err();
        assert!(matches!(err, LoadError::Empty(_)));
    }

    #[test]
    fn widening_returns_a_new_table() {
        let frame = df!("y" => &[1.0, 2.0, 3.0]).unwrap();
        let table = ObservationTable::from_frame(frame).unwrap();
        let cate = RowAligned::new(
            table.ids().clone(),
            Array1::from(vec![0.1, 0.2, 0.3]),
            "cate",
        )
        .unwrap();
        let wider = table.with_f64_column("cate", &cate).unwrap();
        assert_eq!(table.column_names(), vec!["y"]);
        assert_eq!(wider.column_names(), vec!["y", "cate"]);
        assert_eq!(wider.height(), 3);
    }

    #[test]
    fn widening_with_foreign_rows_fails() {
        let frame = df!("y" => &[1.0, 2.0, 3.0]).unwrap();
        let table = ObservationTable::from_frame(frame).unwrap();
        let foreign = RowAligned::new(
            RowIds::from_vec(vec![2, 1, 0]),
            Array1::from(vec![0.1, 0.2, 0.3]),
            "cate",
        )
        .unwrap();
        let err = table.with_f64_column("cate", &foreign).unwrap_err();
        assert!(matches!(
            err,
            TableError::Alignment(AlignmentError::RowIdentity { .. })
        ));
    }
}
