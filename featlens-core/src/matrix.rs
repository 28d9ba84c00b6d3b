//! Fixed-shape, row-major numeric matrix used for instances, batches and
//! background data.

use crate::error::ShapeError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Build from row-major data. Every value must be finite.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, ShapeError> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(ShapeError::new(format!(
                "{} values cannot fill a {rows}x{cols} matrix",
                data.len()
            )));
        }
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(ShapeError::new(format!(
                "non-finite value at row {}, column {}",
                pos / cols.max(1),
                pos % cols.max(1)
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ShapeError> {
        let nrows = rows.len();
        let ncols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(nrows * ncols);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != ncols {
                return Err(ShapeError::new(format!(
                    "row {i} has {} columns, expected {ncols}",
                    row.len()
                )));
            }
            data.extend(row);
        }
        Self::new(nrows, ncols, data)
    }

    /// A single-row matrix.
    pub fn from_row(row: &[f64]) -> Result<Self, ShapeError> {
        Self::new(1, row.len(), row.to_vec())
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Row `i`. Panics when out of bounds, like slice indexing.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.rows).map(move |i| self.row(i))
    }

    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.rows).map(|i| self.data[i * self.cols + j]).collect()
    }

    /// New matrix holding the given rows, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Matrix {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Matrix {
            rows: indices.len(),
            cols: self.cols,
            data,
        }
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.rows().map(<[f64]>::to_vec).collect()
    }

    /// Assemble from rows already known to share `cols` columns. Used by the
    /// kernels to build evaluation batches without re-validating.
    pub(crate) fn from_raw(rows: usize, cols: usize, data: Vec<f64>) -> Matrix {
        debug_assert_eq!(rows * cols, data.len());
        Matrix { rows, cols, data }
    }
}

impl TryFrom<Vec<Vec<f64>>> for Matrix {
    type Error = ShapeError;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self, Self::Error> {
        Matrix::from_rows(rows)
    }
}

impl From<Matrix> for Vec<Vec<f64>> {
    fn from(m: Matrix) -> Self {
        m.to_rows()
    }
}

/// Per-column summary of a background matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
}

impl ColumnStats {
    pub fn compute(m: &Matrix) -> Self {
        let n = m.nrows().max(1) as f64;
        let mut means = vec![0.0; m.ncols()];
        for row in m.rows() {
            for (acc, v) in means.iter_mut().zip(row) {
                *acc += v;
            }
        }
        means.iter_mut().for_each(|v| *v /= n);

        let mut variances = vec![0.0; m.ncols()];
        for row in m.rows() {
            for ((acc, v), mean) in variances.iter_mut().zip(row).zip(&means) {
                *acc += (v - mean).powi(2);
            }
        }
        variances.iter_mut().for_each(|v| *v /= n);

        Self { means, variances }
    }

    /// Indices of columns whose variance exceeds `min_variance`.
    pub fn active_columns(&self, min_variance: f64) -> Vec<usize> {
        self.variances
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > min_variance)
            .map(|(i, _)| i)
            .collect()
    }
}
