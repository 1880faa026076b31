//! Histogram loss with Gaussian smoothing (HL-Gauss).
//!
//! Converts scalar rewards into categorical distributions over fixed-width bins,
//! so that a regression target can be trained as a classification one.
//! See <https://arxiv.org/abs/2403.03950>, page 6.

use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::ModelError;

#[derive(Debug, Copy, Clone)]
pub struct HlGauss {
    v_min: f64,
    v_max: f64,
    n_bins: usize,

    /// Standard deviation of the smoothing Gaussian, in reward units.
    sigma: f64,

    standard_normal: Normal,
}

impl HlGauss {
    /// The paper uses `sigma_over_bin_size = 0.75`.
    pub fn new(
        v_min: f64,
        v_max: f64,
        n_bins: usize,
        sigma_over_bin_size: f64,
    ) -> Result<Self, ModelError> {
        if n_bins == 0 {
            return Err(ModelError::configuration("at least one bin is required"));
        }
        if !(v_min.is_finite() && v_max.is_finite() && v_min < v_max) {
            return Err(ModelError::configuration(format!(
                "invalid support [{}, {}]",
                v_min, v_max,
            )));
        }
        if !(sigma_over_bin_size.is_finite() && sigma_over_bin_size > 0.0) {
            return Err(ModelError::configuration("sigma must be positive"));
        }
        let bin_size = (v_max - v_min) / n_bins as f64;
        let standard_normal = Normal::new(0.0, 1.0)
            .map_err(|error| ModelError::configuration(error.to_string()))?;
        Ok(Self {
            v_min,
            v_max,
            n_bins,
            sigma: sigma_over_bin_size * bin_size,
            standard_normal,
        })
    }

    #[must_use]
    pub const fn n_bins(&self) -> usize {
        self.n_bins
    }

    #[must_use]
    pub fn bin_size(&self) -> f64 {
        (self.v_max - self.v_min) / self.n_bins as f64
    }

    #[must_use]
    pub fn bin_centers(&self) -> Vec<f64> {
        let bin_size = self.bin_size();
        (0..self.n_bins)
            .map(|i| self.v_min + (i as f64 + 0.5) * bin_size)
            .collect()
    }

    /// Probability mass of each bin, one row per reward.
    ///
    /// The first bin absorbs the lower tail and the last bin absorbs the upper one,
    /// so every row sums to one.
    #[must_use]
    pub fn target(&self, rewards: &[f64]) -> Vec<Vec<f64>> {
        rewards.iter().map(|reward| self.target_row(*reward)).collect()
    }

    fn target_row(&self, reward: f64) -> Vec<f64> {
        let bin_size = self.bin_size();
        let cdf = |boundary: f64| self.standard_normal.cdf((boundary - reward) / self.sigma);
        (0..self.n_bins)
            .map(|i| {
                let lower = if i == 0 {
                    0.0
                } else {
                    cdf(self.v_min + i as f64 * bin_size)
                };
                let upper = if i + 1 == self.n_bins {
                    1.0
                } else {
                    cdf(self.v_min + (i + 1) as f64 * bin_size)
                };
                upper - lower
            })
            .collect()
    }

    /// Decodes a distribution back into a scalar as the mean of the bin centers.
    pub fn expected_value(&self, probabilities: &[f64]) -> Result<f64, ModelError> {
        crate::error::ensure_dimension("bin probabilities", self.n_bins, probabilities.len())?;
        Ok(self
            .bin_centers()
            .iter()
            .zip(probabilities)
            .map(|(center, probability)| center * probability)
            .sum())
    }
}
