/// Per-epoch learning rate `initial / (1 + decay · epoch)`, floored at `minimal`.
pub struct LearningRate {
    initial: f64,
    decay: f64,
    factor: f64,
    minimal: f64,
}

impl LearningRate {
    #[must_use]
    pub const fn new(initial: f64, decay: f64, minimal: f64) -> Self {
        Self {
            initial,
            decay,
            minimal,
            factor: 1.0,
        }
    }
}

impl Iterator for LearningRate {
    type Item = f64;

    fn next(&mut self) -> Option<Self::Item> {
        let rate = self.initial / self.factor;
        if rate >= self.minimal {
            self.factor += self.decay;
            Some(rate)
        } else {
            Some(self.minimal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_to_minimal_ok() {
        let rates: Vec<f64> = LearningRate::new(1.0, 1.0, 0.3).take(5).collect();
        assert_eq!(rates, vec![1.0, 0.5, 1.0 / 3.0, 0.3, 0.3]);
    }

    #[test]
    fn constant_without_decay_ok() {
        assert!(LearningRate::new(0.01, 0.0, 0.0).take(100).all(|rate| rate == 0.01));
    }
}
