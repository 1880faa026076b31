use clap::ValueEnum;
use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_dimension, ModelError};
use crate::scorer::{Linear, Parameter, Parameters};

/// Nonlinearity applied after every layer but the last.
#[derive(Serialize, Deserialize, ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
}

impl Activation {
    #[must_use]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed through the activation's output.
    #[must_use]
    pub fn derivative(self, output: f64) -> f64 {
        match self {
            Self::Relu if output > 0.0 => 1.0,
            Self::Relu => 0.0,
            Self::Tanh => 1.0 - output * output,
        }
    }
}

pub struct MlpBuilder {
    input_width: usize,
    widths: Vec<usize>,
    activation: Activation,
    dropout: f64,
}

impl MlpBuilder {
    #[must_use]
    pub const fn new(input_width: usize) -> Self {
        Self {
            input_width,
            widths: Vec::new(),
            activation: Activation::Relu,
            dropout: 0.0,
        }
    }

    /// Layer widths in order, the last one must be `1`.
    #[must_use]
    pub fn widths(mut self, widths: &[usize]) -> Self {
        self.widths = widths.to_vec();
        self
    }

    #[must_use]
    pub const fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Dropout probability after every hidden activation, training only.
    #[must_use]
    pub const fn dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn build(self, rng: &mut impl Rng) -> Result<Mlp, ModelError> {
        if self.input_width == 0 {
            return Err(ModelError::configuration("MLP input width must be positive"));
        }
        match self.widths.last() {
            Some(1) => {}
            Some(width) => {
                return Err(ModelError::configuration(format!(
                    "the last MLP layer must produce a single logit, got width {}",
                    width,
                )));
            }
            None => return Err(ModelError::configuration("MLP needs at least one layer")),
        }
        if self.widths.contains(&0) {
            return Err(ModelError::configuration("MLP layer widths must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::configuration(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout,
            )));
        }

        let mut in_features = self.input_width;
        let mut layers = Vec::with_capacity(self.widths.len());
        for &out_features in &self.widths {
            layers.push(Linear::new(in_features, out_features, rng));
            in_features = out_features;
        }
        Ok(Mlp {
            layers,
            activation: self.activation,
            dropout: self.dropout,
            hidden: Vec::new(),
        })
    }
}

/// Fully-connected stack ending in a single output.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
    dropout: f64,

    /// Hidden activations and dropout masks of the last training forward pass.
    #[serde(skip)]
    hidden: Vec<(DMatrix<f64>, Option<DMatrix<f64>>)>,
}

impl Mlp {
    #[must_use]
    pub fn input_width(&self) -> usize {
        self.layers.first().map_or(0, Linear::in_features)
    }

    #[must_use]
    pub fn widths(&self) -> Vec<usize> {
        self.layers.iter().map(Linear::out_features).collect()
    }

    /// Inference pass, no dropout.
    #[must_use]
    pub fn forward(&self, input: &DMatrix<f64>) -> DMatrix<f64> {
        let n_layers = self.layers.len();
        let mut output = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output);
            if i + 1 != n_layers {
                output.apply(|value| *value = self.activation.apply(*value));
            }
        }
        output
    }

    /// Training pass with inverted dropout, caching what [`Mlp::backward`] needs.
    pub fn forward_train(&mut self, input: DMatrix<f64>, rng: &mut impl Rng) -> DMatrix<f64> {
        let (activation, dropout) = (self.activation, self.dropout);
        let n_layers = self.layers.len();
        self.hidden.clear();

        let mut output = input;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            output = layer.forward_train(output);
            if i + 1 == n_layers {
                break;
            }
            output.apply(|value| *value = activation.apply(*value));
            let activated = output.clone();
            let mask = (dropout > 0.0).then(|| {
                let scale = 1.0 / (1.0 - dropout);
                DMatrix::from_fn(output.nrows(), output.ncols(), |_, _| {
                    if rng.gen::<f64>() < dropout {
                        0.0
                    } else {
                        scale
                    }
                })
            });
            if let Some(mask) = &mask {
                output.component_mul_assign(mask);
            }
            self.hidden.push((activated, mask));
        }
        output
    }

    /// Accumulates the parameter gradients and returns the input gradient.
    pub fn backward(
        &mut self,
        output_gradient: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, ModelError> {
        let activation = self.activation;
        let mut gradient = output_gradient.clone();
        for i in (0..self.layers.len()).rev() {
            if i + 1 != self.layers.len() {
                let (activated, mask) = self.hidden.pop().ok_or_else(|| {
                    ModelError::configuration("backward pass without a training forward pass")
                })?;
                if let Some(mask) = &mask {
                    gradient.component_mul_assign(mask);
                }
                let derivative = activated.map(|output| activation.derivative(output));
                gradient.component_mul_assign(&derivative);
            }
            gradient = self.layers[i].backward(&gradient)?;
        }
        Ok(gradient)
    }

    /// Checks the layer shapes of a deserialized stack.
    pub fn validate(&self, input_width: usize) -> Result<(), ModelError> {
        ensure_dimension("MLP output", 1, self.widths().last().copied().unwrap_or(0))?;
        let mut in_features = input_width;
        for layer in &self.layers {
            layer.validate(in_features, layer.out_features())?;
            in_features = layer.out_features();
        }
        Ok(())
    }
}

impl Parameters for Mlp {
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers
            .iter_mut()
            .flat_map(Parameters::parameters_mut)
            .collect()
    }
}
