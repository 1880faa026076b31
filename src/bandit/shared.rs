use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::bandit::{BanditState, LinearBandit};
use crate::error::ModelError;
use crate::prelude::*;

/// Thread-safe handle to a single estimator.
///
/// Updates hold the write lock, scoring and snapshots hold the read lock,
/// so nobody observes a policy paired with a foreign covariance inverse.
#[derive(Clone, Debug)]
pub struct SharedBandit(Arc<RwLock<LinearBandit>>);

impl SharedBandit {
    #[must_use]
    pub fn new(bandit: LinearBandit) -> Self {
        Self(Arc::new(RwLock::new(bandit)))
    }

    pub fn update<R: AsRef<[f64]>>(
        &self,
        contexts: &[R],
        rewards: &[f64],
    ) -> Result<(), ModelError> {
        self.write().update(contexts, rewards)
    }

    pub fn update_matrix(
        &self,
        contexts: &DMatrix<f64>,
        rewards: &[f64],
    ) -> Result<(), ModelError> {
        self.write().update_matrix(contexts, rewards)
    }

    pub fn predict_matrix(&self, contexts: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        self.read().predict_matrix(contexts)
    }

    pub fn predict<R: AsRef<[f64]>>(&self, contexts: &[R]) -> Result<DVector<f64>, ModelError> {
        self.read().predict(contexts)
    }

    pub fn predict_thompson<R: AsRef<[f64]>>(
        &self,
        contexts: &[R],
        rng: &mut impl Rng,
    ) -> Result<DVector<f64>, ModelError> {
        self.read().predict_thompson(contexts, rng)
    }

    #[must_use]
    pub fn state(&self) -> BanditState {
        self.read().state()
    }

    /// Replaces the estimator with the snapshot, or leaves it intact if the snapshot is invalid.
    pub fn restore(&self, state: BanditState) -> Result<(), ModelError> {
        let bandit = LinearBandit::restore(state)?;
        *self.write() = bandit;
        Ok(())
    }

    pub fn read(&self) -> RwLockReadGuard<'_, LinearBandit> {
        // Updates commit the whole state at once, so even a poisoned lock guards a consistent one.
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LinearBandit> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::bandit::InversionStrategy;

    #[test]
    fn concurrent_readers_see_consistent_state_ok() -> Result {
        let bandit = SharedBandit::new(LinearBandit::new(3, InversionStrategy::ShermanMorrison)?);
        bandit.update(&[[1.0, 0.0, 0.0]], &[1.0])?;

        thread::scope(|scope| -> Result {
            let writer = scope.spawn(|| -> Result {
                for i in 0..200 {
                    let x = i as f64 / 200.0;
                    bandit.update(&[[x, 1.0 - x, x * x]], &[x])?;
                }
                Ok(())
            });
            let readers: Vec<_> = (0..4)
                .map(|seed| {
                    let bandit = bandit.clone();
                    scope.spawn(move || -> Result {
                        let mut rng = StdRng::seed_from_u64(seed);
                        for _ in 0..200 {
                            let state = bandit.state();
                            state.validate()?;
                            bandit.predict_thompson(&[[1.0, 1.0, 1.0]], &mut rng)?;
                        }
                        Ok(())
                    })
                })
                .collect();
            for reader in readers {
                reader.join().map_err(|_| anyhow!("reader panicked"))??;
            }
            writer.join().map_err(|_| anyhow!("writer panicked"))??;
            Ok(())
        })?;

        assert_eq!(bandit.read().n_observations(), 201);
        Ok(())
    }

    #[test]
    fn invalid_restore_keeps_state_ok() -> Result {
        let bandit = SharedBandit::new(LinearBandit::new(2, InversionStrategy::FullReinversion)?);
        bandit.update(&[[1.0, 2.0]], &[3.0])?;
        let before = bandit.state();

        let mut tampered = before.clone();
        tampered.policy[1] = 100.0;
        assert!(bandit.restore(tampered).is_err());
        assert_eq!(bandit.state(), before);
        Ok(())
    }
}
