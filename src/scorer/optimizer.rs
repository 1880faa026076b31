use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::scorer::Parameter;

/// Adam with decoupled weight decay.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdamW {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,

    /// Number of steps taken so far.
    t: i32,

    /// First and second moments, in the order of the parameters passed to [`AdamW::step`].
    #[serde(skip)]
    moments: Vec<(DMatrix<f64>, DMatrix<f64>)>,
}

impl AdamW {
    pub const fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            t: 0,
            moments: Vec::new(),
        }
    }

    #[must_use]
    pub const fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    #[must_use]
    pub const fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Updates every parameter that has an accumulated gradient.
    ///
    /// The parameters must be passed in the same order on every call.
    pub fn step(&mut self, parameters: &mut [&mut Parameter]) {
        self.t = self.t.saturating_add(1);
        let bias_correction1 = 1.0 - self.beta1.powi(self.t);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t);

        if self.moments.len() < parameters.len() {
            self.moments.resize(parameters.len(), (DMatrix::zeros(0, 0), DMatrix::zeros(0, 0)));
        }

        for (parameter, (m, v)) in parameters.iter_mut().zip(&mut self.moments) {
            let (value, gradient) = parameter.value_and_gradient_mut();
            let Some(gradient) = gradient else {
                continue;
            };
            if m.shape() != value.shape() {
                *m = DMatrix::zeros(value.nrows(), value.ncols());
                *v = DMatrix::zeros(value.nrows(), value.ncols());
            }

            *value *= 1.0 - self.learning_rate * self.weight_decay;
            *m = &*m * self.beta1 + gradient * (1.0 - self.beta1);
            *v = &*v * self.beta2 + gradient.component_mul(gradient) * (1.0 - self.beta2);
            for ((value, m), v) in value.iter_mut().zip(m.iter()).zip(v.iter()) {
                let m_hat = m / bias_correction1;
                let v_hat = v / bias_correction2;
                *value -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimizes_quadratic_ok() {
        let mut parameter = Parameter::new(DMatrix::from_row_slice(1, 2, &[3.0, -2.0]));
        let mut optimizer = AdamW::new(0.1).weight_decay(0.0);
        for _ in 0..500 {
            parameter.zero_gradient();
            let gradient = parameter.value() * 2.0;
            parameter.accumulate(&gradient);
            optimizer.step(&mut [&mut parameter]);
        }
        assert!(parameter.value().amax() < 1e-2, "{}", parameter.value());
    }

    #[test]
    fn decoupled_weight_decay_ok() {
        let mut parameter = Parameter::new(DMatrix::from_element(1, 1, 1.0));
        let mut optimizer = AdamW::new(0.1).weight_decay(0.5);
        parameter.accumulate(&DMatrix::zeros(1, 1));
        optimizer.step(&mut [&mut parameter]);
        assert!((parameter.value()[0] - 0.95).abs() < 1e-12);
    }

    #[test]
    fn skips_parameters_without_gradient_ok() {
        let mut parameter = Parameter::new(DMatrix::from_element(2, 2, 1.0));
        AdamW::new(0.1).step(&mut [&mut parameter]);
        assert_eq!(parameter.value(), &DMatrix::from_element(2, 2, 1.0));
    }
}
