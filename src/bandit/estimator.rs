use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::bandit::{BanditState, InversionStrategy};
use crate::error::{ensure_dimension, ModelError};
use crate::math::matrix::{stack_rows, symmetrize};
use crate::prelude::*;

/// Ridge-regularized (λ = 1) least squares over a stream of observations.
///
/// Mutated only through [`LinearBandit::update`], which commits all four tensors at once.
#[derive(Debug, Clone)]
pub struct LinearBandit {
    strategy: InversionStrategy,

    /// `I + Σ xᵢ xᵢᵗ`.
    covariance: DMatrix<f64>,

    covariance_inverse: DMatrix<f64>,

    /// `Σ rᵢ xᵢ`.
    reward_weighted_sum: DVector<f64>,

    /// `covariance_inverse @ reward_weighted_sum`.
    policy: DVector<f64>,

    n_observations: usize,
}

impl LinearBandit {
    pub fn new(dimension: usize, strategy: InversionStrategy) -> Result<Self, ModelError> {
        if dimension == 0 {
            return Err(ModelError::configuration("context dimension must be positive"));
        }
        Ok(Self {
            strategy,
            covariance: DMatrix::identity(dimension, dimension),
            covariance_inverse: DMatrix::identity(dimension, dimension),
            reward_weighted_sum: DVector::zeros(dimension),
            policy: DVector::zeros(dimension),
            n_observations: 0,
        })
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.policy.len()
    }

    #[must_use]
    pub const fn strategy(&self) -> InversionStrategy {
        self.strategy
    }

    #[must_use]
    pub const fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    #[must_use]
    pub const fn covariance_inverse(&self) -> &DMatrix<f64> {
        &self.covariance_inverse
    }

    #[must_use]
    pub const fn reward_weighted_sum(&self) -> &DVector<f64> {
        &self.reward_weighted_sum
    }

    /// Zero until the first update.
    #[must_use]
    pub const fn policy(&self) -> &DVector<f64> {
        &self.policy
    }

    #[must_use]
    pub const fn n_observations(&self) -> usize {
        self.n_observations
    }

    #[must_use]
    pub const fn is_calibrated(&self) -> bool {
        self.n_observations != 0
    }

    /// Absorbs a batch of context rows and their rewards.
    pub fn update<R: AsRef<[f64]>>(
        &mut self,
        contexts: &[R],
        rewards: &[f64],
    ) -> Result<(), ModelError> {
        ensure_dimension("rewards", contexts.len(), rewards.len())?;
        let contexts = stack_rows("context", contexts, self.dimension())?;
        self.update_matrix(&contexts, rewards)
    }

    /// Same as [`LinearBandit::update`] for an `n × d` matrix of contexts.
    #[instrument(level = "trace", skip_all, fields(n_contexts = contexts.nrows()))]
    pub fn update_matrix(
        &mut self,
        contexts: &DMatrix<f64>,
        rewards: &[f64],
    ) -> Result<(), ModelError> {
        ensure_dimension("context", self.dimension(), contexts.ncols())?;
        ensure_dimension("rewards", contexts.nrows(), rewards.len())?;
        if contexts.nrows() == 0 {
            return Ok(());
        }

        // The whole-batch outer product goes into the accumulator first,
        // the incremental inverse then walks the rows one by one.
        let covariance = &self.covariance + contexts.transpose() * contexts;
        let reward_weighted_sum = &self.reward_weighted_sum
            + contexts.transpose() * DVector::from_column_slice(rewards);
        let covariance_inverse = symmetrize(&self.strategy.update_inverse(
            &covariance,
            &self.covariance_inverse,
            contexts,
        )?);
        let policy = &covariance_inverse * &reward_weighted_sum;

        self.covariance = covariance;
        self.covariance_inverse = covariance_inverse;
        self.reward_weighted_sum = reward_weighted_sum;
        self.policy = policy;
        self.n_observations += contexts.nrows();
        Ok(())
    }

    /// Point estimates `contexts @ policy`.
    pub fn predict<R: AsRef<[f64]>>(&self, contexts: &[R]) -> Result<DVector<f64>, ModelError> {
        self.predict_matrix(&stack_rows("context", contexts, self.dimension())?)
    }

    pub fn predict_matrix(&self, contexts: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        ensure_dimension("context", self.dimension(), contexts.ncols())?;
        Ok(contexts * &self.policy)
    }

    /// Scores the contexts against a policy drawn from the posterior, one draw per call.
    pub fn predict_thompson<R: AsRef<[f64]>>(
        &self,
        contexts: &[R],
        rng: &mut impl Rng,
    ) -> Result<DVector<f64>, ModelError> {
        self.predict_thompson_matrix(&stack_rows("context", contexts, self.dimension())?, rng)
    }

    pub fn predict_thompson_matrix(
        &self,
        contexts: &DMatrix<f64>,
        rng: &mut impl Rng,
    ) -> Result<DVector<f64>, ModelError> {
        ensure_dimension("context", self.dimension(), contexts.ncols())?;
        Ok(contexts * self.sample_policy(rng)?)
    }

    /// Draws `θ̃ ~ N(policy, covariance_inverse)`.
    pub fn sample_policy(&self, rng: &mut impl Rng) -> Result<DVector<f64>, ModelError> {
        if !self.is_calibrated() {
            return Err(ModelError::NotCalibrated);
        }
        let factor = match Cholesky::new(self.covariance_inverse.clone()) {
            Some(cholesky) => cholesky.l(),
            None => {
                warn!(
                    dimension = self.dimension(),
                    "Cholesky failed, sampling via eigendecomposition",
                );
                semidefinite_factor(&self.covariance_inverse)?
            }
        };
        let noise = DVector::from_fn(self.dimension(), |_, _| {
            Distribution::<f64>::sample(&StandardNormal, rng)
        });
        Ok(&self.policy + factor * noise)
    }

    #[must_use]
    pub fn state(&self) -> BanditState {
        BanditState {
            strategy: self.strategy,
            covariance: self.covariance.clone(),
            covariance_inverse: self.covariance_inverse.clone(),
            reward_weighted_sum: self.reward_weighted_sum.clone(),
            policy: self.policy.clone(),
            n_observations: self.n_observations,
        }
    }

    /// Rebuilds the estimator from a snapshot, all tensors together.
    pub fn restore(state: BanditState) -> Result<Self, ModelError> {
        state.validate()?;
        Ok(Self {
            strategy: state.strategy,
            covariance: state.covariance,
            covariance_inverse: state.covariance_inverse,
            reward_weighted_sum: state.reward_weighted_sum,
            policy: state.policy,
            n_observations: state.n_observations,
        })
    }
}

/// `V √Λ` of the symmetric eigendecomposition, so that `F Fᵗ` reproduces the matrix
/// with negative rounding noise in the eigenvalues clamped to zero.
fn semidefinite_factor(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, ModelError> {
    let eigen = SymmetricEigen::new(matrix.clone());
    if !eigen.eigenvalues.iter().all(|value| value.is_finite()) {
        return Err(ModelError::NumericalInstability);
    }
    let scales = eigen.eigenvalues.map(|value| value.max(0.0).sqrt());
    Ok(eigen.eigenvectors * DMatrix::from_diagonal(&scales))
}
