//! Strongly typed movie and user feature vectors.

use nalgebra::DMatrix;

pub use self::movie_table::MovieFeatureTable;
pub use self::schema::{FeatureSchema, FieldSpec, Transform};
pub use self::user_table::UserEmbeddingTable;
use crate::error::ModelError;

mod movie_table;
mod schema;
mod user_table;

/// Fixed-width feature vectors addressed by identifier.
pub trait FeatureProvider {
    /// Width of every vector, stable for the lifetime of the provider.
    fn width(&self) -> usize;

    fn index_of(&self, id: &str) -> Option<usize>;

    /// Batch matrix with one row per index, in request order.
    fn gather(&self, indices: &[usize]) -> Result<DMatrix<f64>, ModelError>;

    fn lookup<S: AsRef<str>>(&self, ids: &[S]) -> Result<DMatrix<f64>, ModelError> {
        let indices = ids
            .iter()
            .map(|id| {
                self.index_of(id.as_ref())
                    .ok_or_else(|| ModelError::UnknownIdentifier(id.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.gather(&indices)
    }
}

/// Copies rows of the row-major `values` into a batch matrix.
fn gather_rows(
    values: &[f64],
    width: usize,
    indices: &[usize],
) -> Result<DMatrix<f64>, ModelError> {
    let n_rows = values.len() / width.max(1);
    let mut batch = DMatrix::zeros(indices.len(), width);
    for (row, &index) in indices.iter().enumerate() {
        if index >= n_rows {
            return Err(ModelError::UnknownIdentifier(format!("row #{}", index)));
        }
        let source = &values[index * width..(index + 1) * width];
        for (column, &value) in source.iter().enumerate() {
            batch[(row, column)] = value;
        }
    }
    Ok(batch)
}
