use std::str::FromStr;

use crate::prelude::*;

pub fn non_zero_usize(value: &str) -> Result<usize> {
    match FromStr::from_str(value)? {
        value if value >= 1 => Ok(value),
        _ => Err(anyhow!("expected a positive number")),
    }
}

pub fn positive_f64(value: &str) -> Result<f64> {
    match f64::from_str(value)? {
        value if value > 0.0 && value.is_finite() => Ok(value),
        value => Err(anyhow!("{} is not a positive number", value)),
    }
}

pub fn non_negative_f64(value: &str) -> Result<f64> {
    match f64::from_str(value)? {
        value if value >= 0.0 && value.is_finite() => Ok(value),
        value => Err(anyhow!("{} is negative", value)),
    }
}

/// Dropout and hold-out fractions: `[0, 1)`.
pub fn probability_f64(value: &str) -> Result<f64> {
    match f64::from_str(value)? {
        value if (0.0..1.0).contains(&value) => Ok(value),
        value => Err(anyhow!("{} is not in [0, 1)", value)),
    }
}

pub fn probability_f32(value: &str) -> Result<f32> {
    match f32::from_str(value)? {
        value if (0.0..=1.0).contains(&value) => Ok(value),
        value => Err(anyhow!("{} is not in [0, 1]", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_usize_ok() -> Result {
        assert_eq!(non_zero_usize("16")?, 16);
        assert!(non_zero_usize("0").is_err());
        assert!(non_zero_usize("-1").is_err());
        Ok(())
    }

    #[test]
    fn probability_ok() -> Result {
        assert!((probability_f64("0.2")? - 0.2).abs() < f64::EPSILON);
        assert!(probability_f64("1").is_err());
        assert!(probability_f32("1").is_ok());
        assert!(positive_f64("0").is_err());
        assert!(non_negative_f64("0").is_ok());
        Ok(())
    }
}
