//! Global optimizer hyperparameters, overridable per group.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScionError};
use crate::tensor::TensorData;

/// Defaults shared by every parameter group that does not override them.
///
/// `momentum` uses the *inverted* convention: it is the weight given to the
/// fresh gradient, `m <- (1 - momentum) * m + momentum * g`. `1.0` therefore
/// means "no averaging" and `0.1` corresponds to classical momentum `0.9`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    pub lr: TensorData,
    pub momentum: TensorData,
    pub unconstrained: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            lr: 1e-3,
            momentum: 1.0,
            unconstrained: false,
        }
    }
}

impl OptimizerConfig {
    /// Parses a JSON document such as `{"lr": 0.02, "momentum": 0.1}`.
    /// Missing fields take their defaults.
    pub fn from_json(doc: &str) -> Result<Self> {
        let config: OptimizerConfig = serde_json::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_lr(self.lr)?;
        check_momentum(self.momentum)
    }
}

pub(crate) fn check_lr(lr: TensorData) -> Result<()> {
    if !(lr.is_finite() && lr >= 0.0) {
        return Err(ScionError::config(format!(
            "learning rate must be finite and >= 0, got {lr}"
        )));
    }
    Ok(())
}

pub(crate) fn check_momentum(momentum: TensorData) -> Result<()> {
    if !(momentum > 0.0 && momentum <= 1.0) {
        return Err(ScionError::config(format!(
            "momentum must lie in (0, 1] (weight of the new gradient), got {momentum}"
        )));
    }
    Ok(())
}
