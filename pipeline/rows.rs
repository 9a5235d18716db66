//! # Row Identity
//!
//! Every structure derived from an `ObservationTable` carries the table's row
//! identifiers. Attaching a derived column back to a table is only allowed when
//! the identifiers match exactly, position by position, so a reordered or
//! filtered vector can never be silently re-attached to the wrong individuals.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised when two row-aligned structures disagree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlignmentError {
    #[error("Dimension mismatch: {what} has {found} rows, but {expected} were expected.")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
    #[error(
        "Row identity mismatch: {what} is not aligned with the table (first differing row at position {position})."
    )]
    RowIdentity { what: String, position: usize },
}

/// Ordered, shareable list of row identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIds(Arc<[u64]>);

impl RowIds {
    /// Identifiers `0..n`, used when the input file has no `row_id` column.
    pub fn sequential(n: usize) -> Self {
        Self((0..n as u64).collect())
    }

    pub fn from_vec(ids: Vec<u64>) -> Self {
        Self(ids.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Succeeds only when `other` lists the same identifiers in the same order.
    pub fn ensure_matches(&self, other: &RowIds, what: &str) -> Result<(), AlignmentError> {
        if Arc::ptr_eq(&self.0, &other.0) {
            return Ok(());
        }
        if self.len() != other.len() {
            return Err(AlignmentError::DimensionMismatch {
                what: what.to_string(),
                expected: self.len(),
                found: other.len(),
            });
        }
        match self.0.iter().zip(other.0.iter()).position(|(a, b)| a != b) {
            Some(position) => Err(AlignmentError::RowIdentity {
                what: what.to_string(),
                position,
            }),
            None => Ok(()),
        }
    }
}

/// Anything with a leading row axis.
pub trait RowCount {
    fn row_count(&self) -> usize;
}

impl RowCount for Array1<f64> {
    fn row_count(&self) -> usize {
        self.len()
    }
}

impl RowCount for Array2<f64> {
    fn row_count(&self) -> usize {
        self.nrows()
    }
}

impl<T> RowCount for Vec<T> {
    fn row_count(&self) -> usize {
        self.len()
    }
}

/// A value whose rows are keyed by an explicit `RowIds`.
#[derive(Debug, Clone)]
pub struct RowAligned<T> {
    ids: RowIds,
    values: T,
}

impl<T: RowCount> RowAligned<T> {
    pub fn new(ids: RowIds, values: T, what: &str) -> Result<Self, AlignmentError> {
        if values.row_count() != ids.len() {
            return Err(AlignmentError::DimensionMismatch {
                what: what.to_string(),
                expected: ids.len(),
                found: values.row_count(),
            });
        }
        Ok(Self { ids, values })
    }

    pub fn ids(&self) -> &RowIds {
        &self.ids
    }

    pub fn values(&self) -> &T {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl RowAligned<Array1<f64>> {
    pub fn view(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }
}

impl RowAligned<Array2<f64>> {
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }
}
