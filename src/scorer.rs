//! Factorization-machine scorer: two affine towers crossed pairwise and fed into an MLP.

pub use self::fm::{FactorizationMachine, ScorerConfig};
pub use self::linear::Linear;
pub use self::mlp::{Activation, Mlp, MlpBuilder};
pub use self::optimizer::AdamW;
pub use self::parameter::{Parameter, Parameters};

pub mod fm;
mod linear;
mod mlp;
mod optimizer;
mod parameter;
