use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_dimension, ModelError};

/// Bandit context rows `[movie ‖ user ‖ 1]`, the trailing constant learns the intercept.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ContextLayout {
    pub movie_width: usize,

    /// Zero when the contexts carry no user vector.
    pub user_width: usize,
}

impl ContextLayout {
    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.movie_width + self.user_width + 1
    }

    pub fn assemble(
        &self,
        movies: &DMatrix<f64>,
        users: Option<&DMatrix<f64>>,
    ) -> Result<DMatrix<f64>, ModelError> {
        ensure_dimension("movie vector", self.movie_width, movies.ncols())?;
        let mut contexts = DMatrix::from_element(movies.nrows(), self.dimension(), 1.0);
        contexts
            .columns_mut(0, self.movie_width)
            .copy_from(movies);
        match users {
            Some(users) => {
                ensure_dimension("user vector", self.user_width, users.ncols())?;
                ensure_dimension("user batch", movies.nrows(), users.nrows())?;
                contexts
                    .columns_mut(self.movie_width, self.user_width)
                    .copy_from(users);
            }
            None => ensure_dimension("user vector", self.user_width, 0)?,
        }
        Ok(contexts)
    }
}
