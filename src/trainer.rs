//! Training runs over the ratings export.

use rand::rngs::StdRng;
use rand::SeedableRng;

pub use self::dataset::{Rating, RewardPolicy};
pub use self::loss::Loss;

pub mod bandit;
pub mod dataset;
mod learning_rate;
mod loss;
pub mod scorer;

/// Reproducible when seeded, drawn from the OS otherwise.
#[must_use]
pub fn rng(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}
