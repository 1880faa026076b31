//! Dense matrix helpers shared by the bandit estimator and the scorer.

use nalgebra::DMatrix;

use crate::error::{ensure_dimension, ModelError};

/// Returns `(M + Mᵗ) / 2`.
#[must_use]
pub fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    (matrix + matrix.transpose()) * 0.5
}

#[must_use]
pub fn is_symmetric(matrix: &DMatrix<f64>, tolerance: f64) -> bool {
    matrix.is_square()
        && (0..matrix.nrows()).all(|i| {
            (0..i).all(|j| (matrix[(i, j)] - matrix[(j, i)]).abs() <= tolerance)
        })
}

/// Cheap necessary condition for positive-definiteness.
#[must_use]
pub fn has_positive_diagonal(matrix: &DMatrix<f64>) -> bool {
    matrix
        .diagonal()
        .iter()
        .all(|value| value.is_finite() && *value > 0.0)
}

/// Stacks equally sized rows into an `n × width` matrix.
pub fn stack_rows<R: AsRef<[f64]>>(
    what: &'static str,
    rows: &[R],
    width: usize,
) -> Result<DMatrix<f64>, ModelError> {
    for row in rows {
        ensure_dimension(what, width, row.as_ref().len())?;
    }
    Ok(DMatrix::from_fn(rows.len(), width, |i, j| rows[i].as_ref()[j]))
}

/// Adds the `1 × ncols` row to every row of the matrix.
pub fn add_row_broadcast(matrix: &mut DMatrix<f64>, row: &DMatrix<f64>) {
    debug_assert_eq!(row.shape(), (1, matrix.ncols()));
    for j in 0..matrix.ncols() {
        let value = row[(0, j)];
        for i in 0..matrix.nrows() {
            matrix[(i, j)] += value;
        }
    }
}

/// Sums every column into a `1 × ncols` row.
#[must_use]
pub fn column_sums(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(1, matrix.ncols(), |_, j| matrix.column(j).sum())
}
