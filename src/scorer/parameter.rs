use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Trainable matrix together with its accumulated gradient.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Parameter {
    value: DMatrix<f64>,

    #[serde(skip)]
    gradient: Option<DMatrix<f64>>,
}

impl Parameter {
    #[must_use]
    pub const fn new(value: DMatrix<f64>) -> Self {
        Self {
            value,
            gradient: None,
        }
    }

    #[must_use]
    pub const fn value(&self) -> &DMatrix<f64> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.value
    }

    #[must_use]
    pub const fn gradient(&self) -> Option<&DMatrix<f64>> {
        self.gradient.as_ref()
    }

    /// Splits the borrow for optimizers.
    pub fn value_and_gradient_mut(&mut self) -> (&mut DMatrix<f64>, Option<&DMatrix<f64>>) {
        (&mut self.value, self.gradient.as_ref())
    }

    pub fn accumulate(&mut self, gradient: &DMatrix<f64>) {
        debug_assert_eq!(gradient.shape(), self.value.shape());
        match &mut self.gradient {
            Some(accumulated) => *accumulated += gradient,
            None => self.gradient = Some(gradient.clone()),
        }
    }

    /// Adds `gradient`'s rows to the rows `indices` of the gradient, repeated indices add up.
    pub fn accumulate_rows(&mut self, indices: &[usize], gradient: &DMatrix<f64>) {
        debug_assert_eq!(indices.len(), gradient.nrows());
        let (n_rows, n_columns) = self.value.shape();
        let accumulated = self
            .gradient
            .get_or_insert_with(|| DMatrix::zeros(n_rows, n_columns));
        for (source, &target) in indices.iter().enumerate() {
            let mut row = accumulated.row_mut(target);
            row += gradient.row(source);
        }
    }

    pub fn zero_gradient(&mut self) {
        self.gradient = None;
    }
}

/// Anything owning trainable parameters.
pub trait Parameters {
    /// Parameters in a stable order, which optimizers rely on.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn zero_gradients(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.zero_gradient();
        }
    }
}
