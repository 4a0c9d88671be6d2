//! # Scion Optimizer
//!
//! Norm-constrained steepest descent with momentum. For every tensor the
//! momentum average `m` is turned into a unit direction `d` by the group's
//! norm policy, and the parameter moves toward the linear minimization oracle
//! point `-r d` of the group's norm ball.

use rand::Rng;

use super::config::OptimizerConfig;
use super::engine::{Phase, StepEngine};
use super::group::{GroupSpec, ParamGroup};
use super::state::{MomentumState, OptimizerState, Stateful};
use super::Optimizer;
use crate::error::Result;
use crate::tensor::Tensor;

/// Reference Scion optimizer; keeps one momentum buffer per tensor.
///
/// The training loop writes gradients with [`Tensor::set_grad`] or
/// [`Tensor::accumulate_grad`], calls [`Optimizer::step`], then
/// [`Optimizer::zero_grad`] before the next batch.
#[derive(Debug)]
pub struct Scion {
    engine: StepEngine,
    state: MomentumState,
}

impl Scion {
    /// Creates a new Scion optimizer.
    ///
    /// # Arguments
    /// * `specs`: Parameter groups (tensors plus norm policy, scale and overrides).
    /// * `config`: Optimizer-wide defaults. `momentum` is the weight of the
    ///   *fresh* gradient, i.e. `1 - classical_momentum`.
    ///
    /// Fails with a configuration or shape error before tracking anything if
    /// any group is invalid.
    pub fn new<I>(specs: I, config: OptimizerConfig) -> Result<Self>
    where
        I: IntoIterator<Item = GroupSpec>,
    {
        Ok(Scion {
            engine: StepEngine::new("Scion", specs, config)?,
            state: MomentumState::new(),
        })
    }

    pub fn add_param_group(&mut self, spec: GroupSpec) -> Result<()> {
        let group = self.engine.build_group(spec)?;
        self.engine.adopt(group)
    }

    /// Stops optimizing `tensor` and drops its momentum buffer.
    /// Returns `false` if the tensor was not tracked.
    pub fn untrack(&mut self, tensor: &Tensor) -> bool {
        self.state.remove(tensor.id());
        self.engine.untrack(tensor).is_some()
    }

    /// Radially projects every parameter into its group's norm ball.
    pub fn init(&mut self) -> Result<()> {
        self.engine.init()
    }

    /// Overwrites every parameter with a random point on its group's norm ball
    /// (orthogonal matrices for spectral groups, random signs for sign groups).
    pub fn reinitialize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        self.engine.reinitialize(rng)
    }

    pub fn phase(&self) -> Phase {
        self.engine.phase()
    }

    /// Number of completed steps.
    pub fn steps(&self) -> u64 {
        self.engine.steps()
    }

    pub fn momentum_state(&self) -> &MomentumState {
        &self.state
    }
}

impl Optimizer for Scion {
    fn step(&mut self) -> Result<()> {
        self.engine.begin_step();
        for group in &self.engine.groups {
            for param in group.params() {
                if !param.requires_grad() {
                    continue;
                }
                let grad = match param.grad() {
                    Some(g) => g,
                    None => continue,
                };
                let momentum = self.state.update(param.id(), &grad, group.momentum());
                group.apply_update(param, momentum)?;
            }
        }
        self.engine.end_step();
        Ok(())
    }

    fn zero_grad(&mut self) {
        for group in &self.engine.groups {
            for param in group.params() {
                param.zero_grad();
            }
        }
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.engine.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.engine.groups
    }
}

impl Stateful for Scion {
    fn state_dict(&self) -> OptimizerState {
        self.engine.export(|param| self.state.get(param.id()).cloned())
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let buffers = &mut self.state;
        self.engine.import(state, |param, buf| {
            match buf {
                Some(buf) => buffers.insert(param.id(), buf),
                None => {
                    buffers.remove(param.id());
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScionError;
    use crate::optim::group::GroupConfig;
    use crate::tensor;
    use ndarray::{arr1, Array2, ArrayD, IxDyn};

    fn sign_group(params: Vec<Tensor>) -> GroupSpec {
        GroupConfig::new("Sign")
            .kwarg("normalized", false)
            .with_params(params)
    }

    #[test]
    fn identity_gradient_moves_parameter_by_minus_identity() {
        let p = tensor::zeros(&[4, 4], true);
        let spec = GroupConfig::new("Spectral").scale(1.0).with_params(vec![p.clone()]);
        let config = OptimizerConfig {
            lr: 1.0,
            momentum: 1.0,
            unconstrained: true,
        };
        let mut opt = Scion::new(vec![spec], config).unwrap();
        p.set_grad(&Array2::eye(4).into_dyn()).unwrap();
        opt.step().unwrap();

        let expected = -Array2::<f32>::eye(4).into_dyn();
        for (a, b) in p.data().iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
        assert_eq!(opt.steps(), 1);
        assert_eq!(opt.phase(), Phase::Stepping);
    }

    #[test]
    fn momentum_starts_from_first_gradient() {
        let p = tensor::zeros(&[2], true);
        let config = OptimizerConfig {
            momentum: 0.25,
            ..OptimizerConfig::default()
        };
        let mut opt = Scion::new(vec![sign_group(vec![p.clone()])], config).unwrap();

        p.set_grad(&arr1(&[4.0, -4.0]).into_dyn()).unwrap();
        opt.step().unwrap();
        assert_eq!(opt.momentum_state().get(p.id()).unwrap(), &arr1(&[4.0, -4.0]).into_dyn());

        opt.zero_grad();
        p.set_grad(&arr1(&[0.0, 4.0]).into_dyn()).unwrap();
        opt.step().unwrap();
        assert_eq!(opt.momentum_state().get(p.id()).unwrap(), &arr1(&[3.0, -2.0]).into_dyn());
    }

    #[test]
    fn tensors_without_gradient_are_skipped() {
        let with_grad = tensor::zeros(&[2], true);
        let without = Tensor::new(arr1(&[0.5, 0.5]).into_dyn(), true);
        let frozen = Tensor::new(arr1(&[0.5, 0.5]).into_dyn(), false);
        let mut opt = Scion::new(
            vec![sign_group(vec![with_grad.clone(), without.clone(), frozen.clone()])],
            OptimizerConfig::default(),
        )
        .unwrap();
        with_grad.set_grad(&arr1(&[1.0, 1.0]).into_dyn()).unwrap();
        frozen.set_grad(&arr1(&[1.0, 1.0]).into_dyn()).unwrap();
        opt.step().unwrap();

        assert_ne!(with_grad.data_clone(), ArrayD::<f32>::zeros(IxDyn(&[2])));
        assert_eq!(without.data_clone(), arr1(&[0.5, 0.5]).into_dyn());
        assert_eq!(frozen.data_clone(), arr1(&[0.5, 0.5]).into_dyn());
        assert_eq!(opt.momentum_state().len(), 1);
    }

    #[test]
    fn zero_gradient_leaves_unconstrained_parameter_unchanged() {
        let p = Tensor::new(arr1(&[1.0, 2.0, 3.0]).into_dyn(), true);
        let config = OptimizerConfig {
            lr: 0.5,
            unconstrained: true,
            ..OptimizerConfig::default()
        };
        let mut opt =
            Scion::new(vec![GroupConfig::new("L2").with_params(vec![p.clone()])], config).unwrap();
        p.set_grad(&ArrayD::zeros(IxDyn(&[3]))).unwrap();
        opt.step().unwrap();
        assert_eq!(p.data_clone(), arr1(&[1.0, 2.0, 3.0]).into_dyn());
    }

    #[test]
    fn duplicate_tensors_are_rejected() {
        let p = tensor::zeros(&[3], true);
        let err = Scion::new(
            vec![sign_group(vec![p.clone()]), sign_group(vec![p.clone()])],
            OptimizerConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ScionError::Configuration(_)));

        let mut opt = Scion::new(vec![sign_group(vec![p.clone()])], OptimizerConfig::default()).unwrap();
        assert!(opt.add_param_group(sign_group(vec![p.clone()])).is_err());
        assert_eq!(opt.param_groups().len(), 1);
    }

    #[test]
    fn tensors_belong_to_one_optimizer_at_a_time() {
        let p = tensor::zeros(&[3], true);
        let first = Scion::new(vec![sign_group(vec![p.clone()])], OptimizerConfig::default()).unwrap();
        let err = Scion::new(vec![sign_group(vec![p.clone()])], OptimizerConfig::default()).unwrap_err();
        assert!(matches!(err, ScionError::Configuration(_)));

        drop(first);
        assert!(!p.is_tracked());
        assert!(Scion::new(vec![sign_group(vec![p.clone()])], OptimizerConfig::default()).is_ok());
    }

    #[test]
    fn untrack_drops_tensor_and_buffer() {
        let a = tensor::zeros(&[2], true);
        let b = tensor::zeros(&[2], true);
        let mut opt = Scion::new(vec![sign_group(vec![a.clone(), b.clone()])], OptimizerConfig::default()).unwrap();
        a.set_grad(&arr1(&[1.0, 1.0]).into_dyn()).unwrap();
        opt.step().unwrap();

        assert!(opt.untrack(&a));
        assert!(!opt.untrack(&a));
        assert!(opt.momentum_state().is_empty());
        assert_eq!(opt.param_groups()[0].params().len(), 1);

        // a is free to join another group now
        opt.add_param_group(sign_group(vec![a.clone()])).unwrap();
    }

    #[test]
    fn init_projects_into_the_ball() {
        let big = Tensor::new(ArrayD::from_elem(IxDyn(&[4]), 10.0), true);
        let spec = GroupConfig::new("BiasRMS").scale(2.0).with_params(vec![big.clone()]);
        let mut opt = Scion::new(vec![spec], OptimizerConfig::default()).unwrap();
        assert_eq!(opt.phase(), Phase::Uninitialized);
        opt.init().unwrap();
        assert_eq!(opt.phase(), Phase::Stepping);
        for &x in big.data().iter() {
            assert!((x - 2.0).abs() < 1e-5);
        }
    }
}
