use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Velocity update weights. The constriction factor is derived from
/// `theta = cognitive + social` and requires `theta > 4`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsoCoefficients {
    pub inertia: f64,
    pub cognitive: f64,
    pub social: f64,
}

impl Default for PsoCoefficients {
    fn default() -> Self { Self { inertia: 0.8, cognitive: 2.8, social: 1.3 } }
}

impl PsoCoefficients {
    pub fn theta(&self) -> f64 { self.cognitive + self.social }

    /// `2 / |2 - theta - sqrt(theta^2 - 4 theta)|`
    pub fn constriction(&self) -> f64 {
        let theta = self.theta();
        2.0 / (2.0 - theta - (theta * theta - 4.0 * theta).sqrt()).abs()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("inertia", self.inertia), ("cognitive", self.cognitive), ("social", self.social)] {
            if !value.is_finite() { return Err(ConfigError::NonFiniteCoefficient { name, value }); }
        }
        let theta = self.theta();
        if theta <= 4.0 { return Err(ConfigError::Theta { theta }); }
        Ok(())
    }
}
