//! Errors raised by the numerical core.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// An input vector or matrix disagrees with the configured dimensionality.
    #[error("dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Construction-time contract violation.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The covariance inverse is no longer positive-definite.
    #[error("covariance inverse lost positive-definiteness")]
    NumericalInstability,

    /// Exploration was requested before the first update.
    #[error("the estimator has not seen any observations yet")]
    NotCalibrated,

    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),
}

impl ModelError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Fails with [`ModelError::DimensionMismatch`] unless `actual == expected`.
pub fn ensure_dimension(
    what: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), ModelError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModelError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dimension_ok() {
        assert_eq!(ensure_dimension("context", 3, 3), Ok(()));
        assert_eq!(
            ensure_dimension("context", 3, 2),
            Err(ModelError::DimensionMismatch {
                what: "context",
                expected: 3,
                actual: 2,
            }),
        );
    }
}
