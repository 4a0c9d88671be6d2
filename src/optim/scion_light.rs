//! # ScionLight Optimizer
//!
//! Same update as [`Scion`](super::Scion), without a separate momentum
//! buffer: the optimizer leases each tensor's gradient slot
//! ([`GradMode::Averaged`](crate::tensor::GradMode)) and the slot itself
//! holds the running average. Gradients written by the training loop are
//! folded into it on arrival, so the memory cost is one buffer per tensor
//! instead of two.

use rand::Rng;

use super::config::OptimizerConfig;
use super::engine::{Phase, StepEngine};
use super::group::{GroupSpec, ParamGroup};
use super::state::{OptimizerState, Stateful};
use super::Optimizer;
use crate::error::Result;
use crate::tensor::Tensor;

/// Memory-lean Scion. Leases are released when the optimizer is dropped
/// or a tensor is untracked.
///
/// Because the gradient slot *is* the momentum, `zero_grad` does nothing
/// and must not be relied on to discard gradients. For one gradient per
/// step, and for any number of micro-batches before the first step, the
/// trajectory is bit-identical to [`Scion`](super::Scion). Micro-batches in
/// later steps give the same average up to rounding.
///
/// A tensor tracked by any other optimizer is rejected at construction, and
/// a tensor tracked here cannot join another optimizer until it is released.
#[derive(Debug)]
pub struct ScionLight {
    engine: StepEngine,
}

impl ScionLight {
    /// Creates a new ScionLight optimizer and leases the gradient slot of
    /// every tensor.
    ///
    /// # Arguments
    /// * `specs`: Parameter groups (tensors plus norm policy, scale and overrides).
    /// * `config`: Optimizer-wide defaults. `momentum` is the weight of the
    ///   *fresh* gradient, i.e. `1 - classical_momentum`.
    pub fn new<I>(specs: I, config: OptimizerConfig) -> Result<Self>
    where
        I: IntoIterator<Item = GroupSpec>,
    {
        let engine = StepEngine::new("ScionLight", specs, config)?;
        lease_all(&engine.groups)?;
        Ok(ScionLight { engine })
    }

    pub fn add_param_group(&mut self, spec: GroupSpec) -> Result<()> {
        let group = self.engine.build_group(spec)?;
        lease_all(std::slice::from_ref(&group))?;
        let params = group.params().to_vec();
        if let Err(err) = self.engine.adopt(group) {
            params.iter().for_each(Tensor::release_grad_slot);
            return Err(err);
        }
        Ok(())
    }

    /// Stops optimizing `tensor` and returns its gradient slot to plain
    /// accumulation (the running average is discarded).
    pub fn untrack(&mut self, tensor: &Tensor) -> bool {
        match self.engine.untrack(tensor) {
            Some(param) => {
                param.release_grad_slot();
                true
            }
            None => false,
        }
    }

    /// Radially projects every parameter into its group's norm ball.
    pub fn init(&mut self) -> Result<()> {
        self.engine.init()
    }

    pub fn reinitialize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        self.engine.reinitialize(rng)
    }

    pub fn phase(&self) -> Phase {
        self.engine.phase()
    }

    pub fn steps(&self) -> u64 {
        self.engine.steps()
    }
}

/// Leases every slot in `groups`, or none of them.
fn lease_all(groups: &[ParamGroup]) -> Result<()> {
    let mut leased: Vec<&Tensor> = Vec::new();
    for group in groups {
        for param in group.params() {
            if let Err(err) = param.lease_grad_slot(group.momentum()) {
                leased.iter().for_each(|p| p.release_grad_slot());
                return Err(err.into());
            }
            leased.push(param);
        }
    }
    Ok(())
}

impl Optimizer for ScionLight {
    fn step(&mut self) -> Result<()> {
        self.engine.begin_step();
        for group in &self.engine.groups {
            for param in group.params() {
                if !param.requires_grad() || !param.has_grad() {
                    continue;
                }
                param
                    .with_grad(|momentum| group.apply_update(param, momentum))
                    .transpose()?;
                param.consume_grad();
            }
        }
        self.engine.end_step();
        Ok(())
    }

    /// No-op: the leased gradient slots hold the running averages.
    fn zero_grad(&mut self) {}

    fn param_groups(&self) -> &[ParamGroup] {
        &self.engine.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.engine.groups
    }
}

impl Stateful for ScionLight {
    /// Snapshots the running averages held in the leased slots.
    ///
    /// Take snapshots between a `step` and the next gradient. A gradient that
    /// has arrived but not been stepped is already folded into its slot and
    /// cannot be separated out, so it becomes part of the snapshot (Scion's
    /// snapshot would not contain it). Such snapshots are logged at `warn`.
    fn state_dict(&self) -> OptimizerState {
        let pending = self
            .engine
            .groups
            .iter()
            .flat_map(|g| g.params())
            .filter(|p| p.has_grad())
            .count();
        if pending > 0 {
            log::warn!(
                "ScionLight: snapshot includes {pending} gradient(s) folded in since the last step"
            );
        }
        self.engine.export(Tensor::grad)
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        self.engine
            .import(state, |param, buf| Ok(param.restore_grad_slot(buf)?))
    }
}

impl Drop for ScionLight {
    fn drop(&mut self) {
        for group in &self.engine.groups {
            for param in group.params() {
                param.release_grad_slot();
            }
        }
    }
}
