use clap::ValueEnum;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_dimension, ModelError};
use crate::math::sigmoid;

#[derive(Serialize, Deserialize, ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Loss {
    /// Mean squared error of `sigmoid(logit)` against the target.
    Mse,

    /// Binary cross-entropy with logits.
    #[default]
    Bce,
}

impl Loss {
    /// Mean loss over the batch and its gradient with respect to every logit.
    pub fn evaluate(
        self,
        logits: &DVector<f64>,
        targets: &[f64],
    ) -> Result<(f64, DVector<f64>), ModelError> {
        ensure_dimension("targets", logits.len(), targets.len())?;
        let n = logits.len().max(1) as f64;
        let mut loss = 0.0;
        let mut gradient = DVector::zeros(logits.len());
        for (i, (&logit, &target)) in logits.iter().zip(targets).enumerate() {
            match self {
                Self::Mse => {
                    let prediction = sigmoid(logit);
                    let residual = prediction - target;
                    loss += residual * residual;
                    gradient[i] = 2.0 * residual * prediction * (1.0 - prediction) / n;
                }
                Self::Bce => {
                    // max(z, 0) - z·y + ln(1 + e^-|z|)
                    loss += logit.max(0.0) - logit * target + (-logit.abs()).exp().ln_1p();
                    gradient[i] = (sigmoid(logit) - target) / n;
                }
            }
        }
        Ok((loss / n, gradient))
    }

    /// Loss of a single probability, used for the constant baseline.
    #[must_use]
    pub fn of_probability(self, probability: f64, target: f64) -> f64 {
        match self {
            Self::Mse => (probability - target).powi(2),
            Self::Bce => {
                let probability = probability.clamp(f64::EPSILON, 1.0 - f64::EPSILON);
                -target * probability.ln() - (1.0 - target) * (1.0 - probability).ln()
            }
        }
    }
}

/// Sample-weighted running mean of batch losses.
#[derive(Default, Copy, Clone)]
pub struct MeanLoss {
    sum: f64,
    n: usize,
}

impl MeanLoss {
    pub fn push_batch(&mut self, mean_loss: f64, batch_size: usize) {
        self.sum += mean_loss * batch_size as f64;
        self.n += batch_size;
    }

    pub fn push_sample(&mut self, loss: f64) {
        self.push_batch(loss, 1);
    }

    #[must_use]
    pub fn finalise(&self) -> f64 {
        if self.n == 0 {
            f64::NAN
        } else {
            self.sum / self.n as f64
        }
    }
}

/// Root mean squared error of the pushed residuals.
#[derive(Default, Copy, Clone)]
pub struct Rmse {
    error: f64,
    count: usize,
}

impl Rmse {
    pub fn push(&mut self, residual_error: f64) {
        self.error += residual_error * residual_error;
        self.count += 1;
    }

    #[must_use]
    pub fn average(&self) -> f64 {
        (self.error / self.count.max(1) as f64).sqrt()
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LossPair {
    pub train: f64,
    pub test: f64,
}

impl LossPair {
    #[must_use]
    pub fn builder() -> LossPairBuilder {
        LossPairBuilder::default()
    }

    #[must_use]
    pub fn infinity() -> Self {
        Self {
            train: f64::INFINITY,
            test: f64::INFINITY,
        }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.train.is_finite() && self.test.is_finite()
    }

    /// Whether the test loss beats the `best` one so far.
    ///
    /// Anything beats no model at all, but a NaN test loss never replaces a comparable one.
    #[must_use]
    pub fn improves_on(&self, best: Option<&Self>) -> bool {
        match best {
            None => true,
            Some(best) if best.test.is_nan() => !self.test.is_nan(),
            Some(best) => self.test < best.test,
        }
    }
}

#[derive(Default)]
pub struct LossPairBuilder {
    pub train: MeanLoss,
    pub test: MeanLoss,
}

impl LossPairBuilder {
    #[must_use]
    pub fn finalise(self) -> LossPair {
        LossPair {
            train: self.train.finalise(),
            test: self.test.finalise(),
        }
    }
}
