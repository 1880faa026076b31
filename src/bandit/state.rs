use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::bandit::InversionStrategy;
use crate::error::{ensure_dimension, ModelError};
use crate::math::matrix::{has_positive_diagonal, is_symmetric};

/// Persisted form of [`crate::bandit::LinearBandit`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BanditState {
    pub strategy: InversionStrategy,
    pub covariance: DMatrix<f64>,
    pub covariance_inverse: DMatrix<f64>,
    pub reward_weighted_sum: DVector<f64>,
    pub policy: DVector<f64>,
    pub n_observations: usize,
}

impl BanditState {
    /// Checks that the tensors belong together.
    pub fn validate(&self) -> Result<(), ModelError> {
        let dimension = self.policy.len();
        if dimension == 0 {
            return Err(ModelError::configuration("empty bandit state"));
        }
        ensure_dimension("reward-weighted sum", dimension, self.reward_weighted_sum.len())?;
        for (what, matrix) in [
            ("covariance", &self.covariance),
            ("covariance inverse", &self.covariance_inverse),
        ] {
            ensure_dimension(what, dimension, matrix.nrows())?;
            ensure_dimension(what, dimension, matrix.ncols())?;
            if !is_symmetric(matrix, 1e-9 * matrix.amax().max(1.0)) {
                return Err(ModelError::configuration(format!("{} is not symmetric", what)));
            }
            if !has_positive_diagonal(matrix) {
                return Err(ModelError::NumericalInstability);
            }
        }

        let expected_policy = &self.covariance_inverse * &self.reward_weighted_sum;
        let tolerance = 1e-6 * (1.0 + expected_policy.amax());
        if (&expected_policy - &self.policy).amax() > tolerance {
            return Err(ModelError::configuration(
                "policy does not match the covariance inverse and the reward-weighted sum",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    use super::*;
    use crate::bandit::LinearBandit;
    use crate::prelude::Result;

    fn trained_state() -> Result<BanditState> {
        let mut bandit = LinearBandit::new(2, InversionStrategy::FullReinversion)?;
        bandit.update(&[[1.0, 0.5], [0.0, 1.0], [2.0, -1.0]], &[1.0, 0.0, 1.0])?;
        Ok(bandit.state())
    }

    #[test]
    fn json_round_trip_ok() -> Result {
        let state = trained_state()?;
        let restored: BanditState = serde_json::from_str(&serde_json::to_string(&state)?)?;
        restored.validate()?;
        assert_eq!(restored.strategy, state.strategy);
        assert!((restored.policy - state.policy).amax() < 1e-12);
        Ok(())
    }

    #[test]
    fn random_state_round_trips_exactly_ok() -> Result {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let mut bandit = LinearBandit::new(6, InversionStrategy::ShermanMorrison)?;
            for _ in 0..10 {
                let contexts: Vec<Vec<f64>> = (0..4)
                    .map(|_| (0..6).map(|_| rng.sample(StandardNormal)).collect())
                    .collect();
                let rewards: Vec<f64> = (0..4).map(|_| rng.sample(StandardNormal)).collect();
                bandit.update(&contexts, &rewards)?;
            }
            let state = bandit.state();
            let restored: BanditState = serde_json::from_str(&serde_json::to_string(&state)?)?;
            assert_eq!(restored, state);
        }
        Ok(())
    }

    #[test]
    fn mismatched_policy_fails() -> Result {
        let mut state = trained_state()?;
        state.policy[0] += 1.0;
        assert!(matches!(state.validate(), Err(ModelError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn asymmetric_inverse_fails() -> Result {
        let mut state = trained_state()?;
        state.covariance_inverse[(0, 1)] += 0.1;
        assert!(matches!(state.validate(), Err(ModelError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn wrong_shape_fails() -> Result {
        let mut state = trained_state()?;
        state.reward_weighted_sum = DVector::zeros(3);
        assert!(matches!(state.validate(), Err(ModelError::DimensionMismatch { .. })));
        Ok(())
    }
}
