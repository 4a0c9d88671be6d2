//! # Parameter Groups
//!
//! A group bundles tensors that share one norm policy and one radius scale.
//! `GroupConfig` is the serializable description (string tag plus kwargs);
//! `ParamGroup` is the validated form the optimizers step over.

use ndarray::{ArrayD, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::config::{check_lr, check_momentum, OptimizerConfig};
use super::norms::{KwargValue, Norm, NormKwargs};
use crate::error::{Result, ScionError};
use crate::tensor::{Tensor, TensorData};

fn default_norm() -> String {
    "Auto".to_string()
}

fn one() -> TensorData {
    1.0
}

/// Serializable group description. `lr`, `momentum` and `unconstrained`
/// fall back to the optimizer-wide [`OptimizerConfig`] when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    #[serde(default = "default_norm")]
    pub norm: String,
    #[serde(default)]
    pub norm_kwargs: NormKwargs,
    #[serde(default = "one")]
    pub scale: TensorData,
    #[serde(default)]
    pub lr: Option<TensorData>,
    /// Weight of the fresh gradient in the momentum average (see [`OptimizerConfig`]).
    #[serde(default)]
    pub momentum: Option<TensorData>,
    #[serde(default)]
    pub unconstrained: Option<bool>,
    #[serde(default = "one")]
    pub lr_multiplier: TensorData,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig::new(default_norm())
    }
}

impl GroupConfig {
    pub fn new(norm: impl Into<String>) -> Self {
        GroupConfig {
            norm: norm.into(),
            norm_kwargs: NormKwargs::new(),
            scale: 1.0,
            lr: None,
            momentum: None,
            unconstrained: None,
            lr_multiplier: 1.0,
        }
    }

    pub fn from_json(doc: &str) -> Result<Self> {
        Ok(serde_json::from_str(doc)?)
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<KwargValue>) -> Self {
        self.norm_kwargs.insert(name.into(), value.into());
        self
    }

    pub fn scale(mut self, scale: TensorData) -> Self {
        self.scale = scale;
        self
    }

    pub fn lr(mut self, lr: TensorData) -> Self {
        self.lr = Some(lr);
        self
    }

    pub fn momentum(mut self, momentum: TensorData) -> Self {
        self.momentum = Some(momentum);
        self
    }

    pub fn unconstrained(mut self, unconstrained: bool) -> Self {
        self.unconstrained = Some(unconstrained);
        self
    }

    pub fn lr_multiplier(mut self, lr_multiplier: TensorData) -> Self {
        self.lr_multiplier = lr_multiplier;
        self
    }

    /// Attaches the tensors this configuration applies to.
    pub fn with_params<I>(self, params: I) -> GroupSpec
    where
        I: IntoIterator<Item = Tensor>,
    {
        GroupSpec {
            params: params.into_iter().collect(),
            config: self,
        }
    }
}

/// Tensors plus their group configuration, as handed to an optimizer.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub params: Vec<Tensor>,
    pub config: GroupConfig,
}

/// A validated parameter group.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub(crate) params: Vec<Tensor>,
    norm: Norm,
    scale: TensorData,
    lr: TensorData,
    momentum: TensorData,
    unconstrained: bool,
    lr_multiplier: TensorData,
}

impl ParamGroup {
    /// Resolves `spec` against the optimizer defaults and validates every
    /// hyperparameter and tensor shape.
    pub(crate) fn build(spec: GroupSpec, defaults: &OptimizerConfig) -> Result<Self> {
        let GroupSpec { params, config } = spec;
        let norm = Norm::parse(&config.norm, &config.norm_kwargs)?;

        if !(config.scale.is_finite() && config.scale > 0.0) {
            return Err(ScionError::config(format!(
                "scale must be finite and > 0, got {}",
                config.scale
            )));
        }
        if !(config.lr_multiplier.is_finite() && config.lr_multiplier >= 0.0) {
            return Err(ScionError::config(format!(
                "lr_multiplier must be finite and >= 0, got {}",
                config.lr_multiplier
            )));
        }
        let lr = config.lr.unwrap_or(defaults.lr);
        check_lr(lr)?;
        let momentum = config.momentum.unwrap_or(defaults.momentum);
        check_momentum(momentum)?;

        for param in &params {
            norm.check_shape(param.shape())?;
        }

        let group = ParamGroup {
            params,
            norm,
            scale: config.scale,
            lr,
            momentum,
            unconstrained: config.unconstrained.unwrap_or(defaults.unconstrained),
            lr_multiplier: config.lr_multiplier,
        };
        group.warn_if_overshooting();
        Ok(group)
    }

    fn warn_if_overshooting(&self) {
        let lr = self.effective_lr();
        if !self.unconstrained && lr > 1.0 {
            log::warn!(
                "constrained {} group has lr * lr_multiplier = {lr} > 1; parameters may leave their norm ball",
                self.norm.kind()
            );
        }
    }

    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    pub fn norm(&self) -> &Norm {
        &self.norm
    }

    pub fn scale(&self) -> TensorData {
        self.scale
    }

    pub fn lr(&self) -> TensorData {
        self.lr
    }

    /// Weight of the fresh gradient in the momentum average.
    pub fn momentum(&self) -> TensorData {
        self.momentum
    }

    pub fn is_unconstrained(&self) -> bool {
        self.unconstrained
    }

    pub fn lr_multiplier(&self) -> TensorData {
        self.lr_multiplier
    }

    /// `lr * lr_multiplier`, the step size actually applied.
    pub fn effective_lr(&self) -> TensorData {
        self.lr * self.lr_multiplier
    }

    pub fn set_lr(&mut self, lr: TensorData) -> Result<()> {
        check_lr(lr)?;
        let was_overshooting = self.lr * self.lr_multiplier > 1.0;
        self.lr = lr;
        if !was_overshooting {
            self.warn_if_overshooting();
        }
        Ok(())
    }

    /// Radius of this group's ball for a tensor of `shape`.
    pub fn radius(&self, shape: &[usize]) -> Result<TensorData> {
        self.norm.radius(self.scale, shape)
    }

    /// Applies one LMO step to `param` given its momentum buffer.
    ///
    /// Constrained: `p <- (1 - lr) p - lr r d`, a convex combination of `p`
    /// and the LMO point `-r d`. Unconstrained: `p <- p - lr r d`.
    pub(crate) fn apply_update(&self, param: &Tensor, momentum: &ArrayD<TensorData>) -> Result<()> {
        let direction = self.norm.direction(momentum)?;
        let radius = self.radius(param.shape())?;
        let lr = self.effective_lr();
        let step = lr * radius;
        let keep = if self.unconstrained { 1.0 } else { 1.0 - lr };

        let mut data = param.data_mut();
        Zip::from(&mut *data)
            .and(&direction)
            .for_each(|p, &d| *p = keep * *p - step * d);
        Ok(())
    }

    /// Radially projects `param` into the group's ball if it lies outside.
    pub(crate) fn project(&self, param: &Tensor) -> Result<()> {
        let radius = self.radius(param.shape())?;
        let mut data = param.data_mut();
        let current = self.norm.norm(&data)?;
        if current > radius {
            let factor = radius / current;
            data.mapv_inplace(|x| x * factor);
        }
        Ok(())
    }

    /// Overwrites `param` with a random point on the group's ball.
    pub(crate) fn reinitialize<R: Rng + ?Sized>(&self, param: &Tensor, rng: &mut R) -> Result<()> {
        let radius = self.radius(param.shape())?;
        let point = self.norm.random_unit_point(param.shape(), rng)? * radius;
        param.assign(&point)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::norms::{NormKind, SignOptions};
    use crate::tensor;
    use ndarray::{arr1, arr2};

    fn build(config: GroupConfig, params: Vec<Tensor>) -> Result<ParamGroup> {
        ParamGroup::build(config.with_params(params), &OptimizerConfig::default())
    }

    #[test]
    fn group_inherits_optimizer_defaults() {
        let defaults = OptimizerConfig {
            lr: 0.05,
            momentum: 0.1,
            unconstrained: true,
        };
        let spec = GroupConfig::new("Sign").lr(0.2).with_params(vec![tensor::zeros(&[4], true)]);
        let group = ParamGroup::build(spec, &defaults).unwrap();
        assert_eq!(group.lr(), 0.2);
        assert_eq!(group.momentum(), 0.1);
        assert!(group.is_unconstrained());
        assert_eq!(*group.norm(), Norm::Sign(SignOptions::default()));
    }

    #[test]
    fn invalid_hyperparameters_are_rejected() {
        let p = || vec![tensor::zeros(&[2, 2], true)];
        for config in [
            GroupConfig::new("Spectral").scale(0.0),
            GroupConfig::new("Spectral").scale(-1.0),
            GroupConfig::new("Spectral").scale(TensorData::INFINITY),
            GroupConfig::new("Spectral").momentum(0.0),
            GroupConfig::new("Spectral").momentum(1.01),
            GroupConfig::new("Spectral").lr(-0.1),
            GroupConfig::new("Spectral").lr_multiplier(-2.0),
            GroupConfig::new("Bogus"),
        ] {
            assert!(matches!(build(config, p()), Err(ScionError::Configuration(_))));
        }
    }

    #[test]
    fn tensor_shapes_are_checked_up_front() {
        let err = build(GroupConfig::new("Spectral"), vec![tensor::zeros(&[8], true)]).unwrap_err();
        assert!(matches!(err, ScionError::Shape { norm: NormKind::Spectral, .. }));
    }

    #[test]
    fn group_config_from_json() {
        let config = GroupConfig::from_json(
            r#"{"norm": "Spectral", "norm_kwargs": {"max": true, "backend": "newton", "steps": 3}, "scale": 50.0}"#,
        )
        .unwrap();
        assert_eq!(
            config,
            GroupConfig::new("Spectral")
                .kwarg("max", true)
                .kwarg("backend", "newton")
                .kwarg("steps", 3)
                .scale(50.0)
        );
        assert!(GroupConfig::from_json(r#"{"norm": "Sign", "radius": 2}"#).is_err());
    }

    #[test]
    fn constrained_update_is_a_convex_combination() {
        let group = build(
            GroupConfig::new("Sign").kwarg("normalized", false).scale(2.0).lr(0.25),
            vec![],
        )
        .unwrap();
        let p = Tensor::new(arr1(&[1.0, -1.0]).into_dyn(), true);
        group.apply_update(&p, &arr1(&[3.0, -0.5]).into_dyn()).unwrap();
        // 0.75 * p - 0.25 * 2 * sign(m)
        assert_eq!(p.data_clone(), arr1(&[0.25, -0.25]).into_dyn());
    }

    #[test]
    fn projection_only_shrinks() {
        let group = build(GroupConfig::new("L2").scale(1.0), vec![]).unwrap();
        let outside = Tensor::new(arr2(&[[3.0, 0.0], [0.0, 4.0]]).into_dyn(), true);
        group.project(&outside).unwrap();
        assert_eq!(outside.data_clone(), arr2(&[[0.6, 0.0], [0.0, 0.8]]).into_dyn());

        let inside = Tensor::new(arr1(&[0.1, 0.2]).into_dyn(), true);
        group.project(&inside).unwrap();
        assert_eq!(inside.data_clone(), arr1(&[0.1, 0.2]).into_dyn());
    }
}
