//! Controllers of the KL penalty coefficient.
use serde::{Deserialize, Serialize};

/// Adapts the KL penalty coefficient toward a target KL divergence.
///
/// After each training pass, [`KlController::update`] nudges the
/// coefficient proportionally to how far the measured KL is from the
/// target, with the proportional error clipped to ±0.2.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AdaptiveKlController {
    /// Current KL penalty coefficient.
    pub value: f64,

    /// Target KL divergence.
    pub target: f64,

    /// Horizon, in consumed samples, over which the coefficient adapts.
    pub horizon: f64,
}

impl AdaptiveKlController {
    fn update(&mut self, current: f32, n_steps: usize) {
        let proportional_error = (current as f64 / self.target - 1.0).clamp(-0.2, 0.2);
        let mult = 1.0 + proportional_error * n_steps as f64 / self.horizon;
        self.value *= mult;
    }
}

/// Controllers of the KL penalty coefficient.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum KlController {
    /// Adaptive controller, used when a target KL is configured.
    Adaptive(AdaptiveKlController),

    /// Fixed coefficient.
    Fixed {
        /// KL penalty coefficient.
        value: f64,
    },
}

impl KlController {
    /// Constructs a controller: adaptive if `kl_target` is given,
    /// fixed otherwise.
    pub fn new(init_kl_coef: f64, kl_target: Option<f64>, kl_horizon: f64) -> Self {
        match kl_target {
            Some(target) => Self::Adaptive(AdaptiveKlController {
                value: init_kl_coef,
                target,
                horizon: kl_horizon,
            }),
            None => Self::Fixed {
                value: init_kl_coef,
            },
        }
    }

    /// Returns the current KL penalty coefficient.
    pub fn value(&self) -> f64 {
        match self {
            Self::Adaptive(c) => c.value,
            Self::Fixed { value } => *value,
        }
    }

    /// Updates the coefficient given the measured mean KL and the number
    /// of samples consumed in the iteration. No-op for fixed controllers.
    pub fn update(&mut self, current: f32, n_steps: usize) {
        if let Self::Adaptive(c) = self {
            c.update(current, n_steps)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_controller() {
        let mut ctl = KlController::new(0.01, None, 10000.0);
        ctl.update(5.0, 128);
        assert_eq!(ctl.value(), 0.01);
    }

    #[test]
    fn test_adaptive_controller_moves_toward_target() {
        let mut ctl = KlController::new(0.01, Some(1.0), 10000.0);

        // Measured KL above target: coefficient grows.
        ctl.update(10.0, 1000);
        assert!(ctl.value() > 0.01);

        // Measured KL below target: coefficient shrinks.
        let before = ctl.value();
        ctl.update(0.01, 1000);
        assert!(ctl.value() < before);
    }

    #[test]
    fn test_adaptive_controller_error_is_clipped() {
        let mut a = KlController::new(0.01, Some(1.0), 10000.0);
        let mut b = KlController::new(0.01, Some(1.0), 10000.0);
        a.update(100.0, 1000);
        b.update(2.0, 1000);
        // Both updates saturate the +0.2 clip.
        assert!((a.value() - b.value()).abs() < 1e-12);
    }
}
