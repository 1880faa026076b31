use nalgebra::DMatrix;
use rand::distributions::Uniform;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_dimension, ModelError};
use crate::math::matrix::{add_row_broadcast, column_sums};
use crate::scorer::{Parameter, Parameters};

/// Affine layer `y = x W + b` over row-major batches.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Linear {
    /// `in_features × out_features`.
    weight: Parameter,

    /// `1 × out_features`.
    bias: Parameter,

    /// Input of the last training forward pass.
    #[serde(skip)]
    input: Option<DMatrix<f64>>,
}

impl Linear {
    /// Initializes both the weight and the bias from `U(-1/√in, 1/√in)`.
    pub fn new(in_features: usize, out_features: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (in_features as f64).sqrt();
        let distribution = Uniform::new_inclusive(-bound, bound);
        Self {
            weight: Parameter::new(DMatrix::from_fn(in_features, out_features, |_, _| {
                rng.sample(distribution)
            })),
            bias: Parameter::new(DMatrix::from_fn(1, out_features, |_, _| {
                rng.sample(distribution)
            })),
            input: None,
        }
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.value().nrows()
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.value().ncols()
    }

    #[must_use]
    pub fn forward(&self, input: &DMatrix<f64>) -> DMatrix<f64> {
        let mut output = input * self.weight.value();
        add_row_broadcast(&mut output, self.bias.value());
        output
    }

    /// Same as [`Linear::forward`], but keeps the input for [`Linear::backward`].
    pub fn forward_train(&mut self, input: DMatrix<f64>) -> DMatrix<f64> {
        let output = self.forward(&input);
        self.input = Some(input);
        output
    }

    /// Accumulates the parameter gradients and returns the input gradient.
    pub fn backward(
        &mut self,
        output_gradient: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, ModelError> {
        let input = self.input.take().ok_or_else(|| {
            ModelError::configuration("backward pass without a training forward pass")
        })?;
        ensure_dimension("output gradient", self.out_features(), output_gradient.ncols())?;
        ensure_dimension("output gradient batch", input.nrows(), output_gradient.nrows())?;
        self.weight.accumulate(&(input.transpose() * output_gradient));
        self.bias.accumulate(&column_sums(output_gradient));
        Ok(output_gradient * self.weight.value().transpose())
    }

    /// Checks the shapes of a deserialized layer.
    pub fn validate(&self, in_features: usize, out_features: usize) -> Result<(), ModelError> {
        ensure_dimension("layer input", in_features, self.in_features())?;
        ensure_dimension("layer output", out_features, self.out_features())?;
        ensure_dimension("layer bias", out_features, self.bias.value().ncols())?;
        ensure_dimension("layer bias rows", 1, self.bias.value().nrows())
    }
}

impl Parameters for Linear {
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}
