//! Bookkeeping shared by [`Scion`] and [`ScionLight`]: group construction and
//! validation, lifecycle phase, step counting, initialization and snapshot
//! plumbing. The two optimizers differ only in where momentum lives.
//!
//! [`Scion`]: super::Scion
//! [`ScionLight`]: super::ScionLight

use ndarray::ArrayD;
use rand::Rng;
use std::collections::HashSet;

use super::config::OptimizerConfig;
use super::group::{GroupSpec, ParamGroup};
use super::state::OptimizerState;
use crate::error::{Result, ScionError};
use crate::tensor::{Tensor, TensorData, TensorId};

/// Snapshots from either optimizer load into the other.
const COMPATIBLE_STATES: [&str; 2] = ["Scion", "ScionLight"];

/// Lifecycle of an optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed; parameters have not been projected or stepped.
    Uninitialized,
    /// `init`, `reinitialize` or a first `step` has run.
    Stepping,
}

#[derive(Debug)]
pub(crate) struct StepEngine {
    name: &'static str,
    pub(crate) groups: Vec<ParamGroup>,
    defaults: OptimizerConfig,
    phase: Phase,
    steps: u64,
}

impl StepEngine {
    pub(crate) fn new<I>(name: &'static str, specs: I, defaults: OptimizerConfig) -> Result<Self>
    where
        I: IntoIterator<Item = GroupSpec>,
    {
        defaults.validate()?;
        let mut engine = StepEngine {
            name,
            groups: Vec::new(),
            defaults,
            phase: Phase::Uninitialized,
            steps: 0,
        };
        for spec in specs {
            let group = engine.build_group(spec)?;
            engine.adopt(group)?;
        }
        log::debug!(
            "{name}: {} groups, {} tensors",
            engine.groups.len(),
            engine.groups.iter().map(|g| g.params().len()).sum::<usize>()
        );
        Ok(engine)
    }

    /// Validates `spec` against the tensors already tracked without adding it.
    pub(crate) fn build_group(&self, spec: GroupSpec) -> Result<ParamGroup> {
        let mut seen: HashSet<TensorId> = self
            .groups
            .iter()
            .flat_map(|g| g.params().iter().map(Tensor::id))
            .collect();
        for param in &spec.params {
            if !seen.insert(param.id()) {
                return Err(ScionError::config(format!(
                    "tensor {} appears in more than one parameter group",
                    param.id()
                )));
            }
            if param.is_tracked() {
                return Err(ScionError::config(format!(
                    "tensor {} is already tracked by another optimizer",
                    param.id()
                )));
            }
        }
        ParamGroup::build(spec, &self.defaults)
    }

    /// Claims every tensor of `group` and starts tracking it. Nothing stays
    /// claimed if any claim fails.
    pub(crate) fn adopt(&mut self, group: ParamGroup) -> Result<()> {
        for (i, param) in group.params().iter().enumerate() {
            if let Err(err) = param.claim() {
                group.params()[..i].iter().for_each(Tensor::unclaim);
                return Err(err.into());
            }
        }
        self.groups.push(group);
        Ok(())
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn steps(&self) -> u64 {
        self.steps
    }

    pub(crate) fn begin_step(&mut self) {
        if self.phase == Phase::Uninitialized {
            log::warn!(
                "{}: stepping without init(); the norm bound only holds if the initial parameters already satisfy it",
                self.name
            );
            self.phase = Phase::Stepping;
        }
    }

    pub(crate) fn end_step(&mut self) {
        self.steps += 1;
        log::trace!("{}: completed step {}", self.name, self.steps);
    }

    pub(crate) fn init(&mut self) -> Result<()> {
        for group in &self.groups {
            for param in group.params() {
                group.project(param)?;
            }
        }
        log::debug!("{}: projected parameters into their norm balls", self.name);
        self.phase = Phase::Stepping;
        Ok(())
    }

    pub(crate) fn reinitialize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        for group in &self.groups {
            for param in group.params() {
                group.reinitialize(param, rng)?;
            }
        }
        log::debug!("{}: reinitialized parameters on their norm balls", self.name);
        self.phase = Phase::Stepping;
        Ok(())
    }

    /// Removes `tensor` from whichever group holds it.
    pub(crate) fn untrack(&mut self, tensor: &Tensor) -> Option<Tensor> {
        let removed = self.groups.iter_mut().find_map(|group| {
            let index = group.params.iter().position(|p| p.id() == tensor.id())?;
            Some(group.params.remove(index))
        })?;
        removed.unclaim();
        Some(removed)
    }

    /// Exports lrs, step count and whatever `buffer` returns for each tensor.
    pub(crate) fn export<F>(&self, mut buffer: F) -> OptimizerState
    where
        F: FnMut(&Tensor) -> Option<ArrayD<TensorData>>,
    {
        let mut state = OptimizerState::new(self.name);
        state.steps = self.steps;
        state.group_lrs = self.groups.iter().map(ParamGroup::lr).collect();
        for (g, group) in self.groups.iter().enumerate() {
            for (i, param) in group.params().iter().enumerate() {
                if let Some(buf) = buffer(param) {
                    state.set_buffer(g, i, &buf);
                }
            }
        }
        state
    }

    /// Checks `state` against the tracked groups, then applies it: lrs and
    /// step count directly, buffers through `restore`.
    pub(crate) fn import<F>(&mut self, state: &OptimizerState, mut restore: F) -> Result<()>
    where
        F: FnMut(&Tensor, Option<ArrayD<TensorData>>) -> Result<()>,
    {
        if !COMPATIBLE_STATES.contains(&state.optimizer_type.as_str()) {
            return Err(ScionError::State(format!(
                "cannot load {} state into {}",
                state.optimizer_type, self.name
            )));
        }
        if state.group_lrs.len() != self.groups.len() {
            return Err(ScionError::State(format!(
                "snapshot has {} groups, optimizer has {}",
                state.group_lrs.len(),
                self.groups.len()
            )));
        }

        let mut expected = 0;
        let mut restored = Vec::new();
        for (g, group) in self.groups.iter().enumerate() {
            for (i, param) in group.params().iter().enumerate() {
                let buf = match state.get_buffer(g, i) {
                    Some(flat) => {
                        expected += 1;
                        if flat.shape != param.shape() {
                            return Err(ScionError::State(format!(
                                "buffer {} has shape {:?}, tensor has {:?}",
                                OptimizerState::buffer_key(g, i),
                                flat.shape,
                                param.shape()
                            )));
                        }
                        Some(flat.to_array()?)
                    }
                    None => None,
                };
                restored.push((param.clone(), buf));
            }
        }
        if expected != state.buffers.len() {
            return Err(ScionError::State(format!(
                "snapshot holds {} buffers that match no tracked tensor",
                state.buffers.len() - expected
            )));
        }
        for &lr in &state.group_lrs {
            super::config::check_lr(lr)?;
        }

        for (group, &lr) in self.groups.iter_mut().zip(&state.group_lrs) {
            group.set_lr(lr)?;
        }
        for (param, buf) in restored {
            restore(&param, buf)?;
        }
        self.steps = state.steps;
        self.phase = Phase::Stepping;
        log::debug!(
            "{}: resumed from {} state at step {}",
            self.name,
            state.optimizer_type,
            self.steps
        );
        Ok(())
    }
}

impl Drop for StepEngine {
    fn drop(&mut self) {
        for group in &self.groups {
            group.params().iter().for_each(Tensor::unclaim);
        }
    }
}
