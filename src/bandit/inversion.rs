use clap::ValueEnum;
use nalgebra::{Cholesky, DMatrix};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::math::matrix::has_positive_diagonal;
use crate::prelude::*;

/// How the covariance inverse follows the accumulator.
#[derive(Serialize, Deserialize, ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InversionStrategy {
    /// Inverts the accumulator from scratch, `O(d³)` per update.
    #[default]
    FullReinversion,

    /// Applies one Sherman-Morrison rank-1 update per context row, `O(d²)` per row.
    ShermanMorrison,
}

impl InversionStrategy {
    /// Computes the inverse of `covariance`, which already includes the outer products of
    /// `contexts`, given the `inverse` of the covariance before they were added.
    ///
    /// Falls back to the full re-inversion when the incremental result
    /// loses its positive diagonal.
    pub fn update_inverse(
        self,
        covariance: &DMatrix<f64>,
        inverse: &DMatrix<f64>,
        contexts: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, ModelError> {
        match self {
            Self::FullReinversion => invert(covariance),
            Self::ShermanMorrison => {
                let updated = sherman_morrison(inverse, contexts);
                if has_positive_diagonal(&updated) {
                    Ok(updated)
                } else {
                    warn!(
                        n_contexts = contexts.nrows(),
                        "incremental inverse is not positive-definite, re-inverting",
                    );
                    invert(covariance)
                }
            }
        }
    }
}

/// Inverts the symmetric positive-definite accumulator.
fn invert(covariance: &DMatrix<f64>) -> Result<DMatrix<f64>, ModelError> {
    Cholesky::new(covariance.clone())
        .map(|cholesky| cholesky.inverse())
        .or_else(|| covariance.clone().try_inverse())
        .filter(has_positive_diagonal)
        .ok_or(ModelError::NumericalInstability)
}

/// `A⁻¹ ← A⁻¹ − (A⁻¹ u uᵗ A⁻¹) / (1 + uᵗ A⁻¹ u)` for every row `u`, in order.
///
/// Each step must see the inverse produced by the previous row.
fn sherman_morrison(inverse: &DMatrix<f64>, contexts: &DMatrix<f64>) -> DMatrix<f64> {
    let mut inverse = inverse.clone();
    for row in contexts.row_iter() {
        let u = row.transpose();
        let left = &inverse * &u;
        let right = u.transpose() * &inverse;
        let denominator = 1.0 + (&right * &u)[(0, 0)];
        inverse -= (left * right) / denominator;
    }
    inverse
}
