//! Linear contextual bandit: ridge regression over a stream of `(context, reward)` pairs
//! with optional Thompson-sampling exploration.

pub use self::context::ContextLayout;
pub use self::estimator::LinearBandit;
pub use self::inversion::InversionStrategy;
pub use self::shared::SharedBandit;
pub use self::state::BanditState;

mod context;
mod estimator;
mod inversion;
mod shared;
mod state;
