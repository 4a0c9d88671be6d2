//! # Learning-Rate Schedules
//!
//! Schedulers rescale the learning rate of every parameter group of an
//! optimizer relative to the rates the groups had when the scheduler was
//! created.
//!
//! ```ignore
//! let mut sched = LambdaLr::new(&mut opt, linear_decay(total_steps))?;
//! for batch in batches {
//!     // ... write gradients ...
//!     opt.step()?;
//!     sched.step(&mut opt)?;
//! }
//! ```

use super::Optimizer;
use crate::error::Result;
use crate::tensor::TensorData;

pub trait LrScheduler {
    /// Advances one step and writes the new learning rates into `optimizer`.
    fn step(&mut self, optimizer: &mut dyn Optimizer) -> Result<()>;

    /// The factor applied by the latest `step` (or at construction).
    fn last_factor(&self) -> TensorData;

    fn current_step(&self) -> u64;
}

/// Sets each group's lr to `base_lr * lambda(step)`.
pub struct LambdaLr {
    base_lrs: Vec<TensorData>,
    lambda: Box<dyn Fn(u64) -> TensorData + Send>,
    current: u64,
    last_factor: TensorData,
}

impl LambdaLr {
    /// Records the current group learning rates as base rates and applies
    /// `lambda(0)` immediately.
    pub fn new<F>(optimizer: &mut dyn Optimizer, lambda: F) -> Result<Self>
    where
        F: Fn(u64) -> TensorData + Send + 'static,
    {
        let base_lrs = optimizer.param_groups().iter().map(|g| g.lr()).collect();
        let mut scheduler = LambdaLr {
            base_lrs,
            lambda: Box::new(lambda),
            current: 0,
            last_factor: 1.0,
        };
        scheduler.apply(optimizer)?;
        Ok(scheduler)
    }

    fn apply(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        let factor = (self.lambda)(self.current);
        // groups added after the scheduler was built keep their own rate
        for (group, &base) in optimizer.param_groups_mut().iter_mut().zip(&self.base_lrs) {
            group.set_lr(base * factor)?;
        }
        self.last_factor = factor;
        Ok(())
    }
}

impl LrScheduler for LambdaLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        self.current += 1;
        self.apply(optimizer)
    }

    fn last_factor(&self) -> TensorData {
        self.last_factor
    }

    fn current_step(&self) -> u64 {
        self.current
    }
}

/// `1 - step / total_steps`, clamped at 0.
pub fn linear_decay(total_steps: u64) -> impl Fn(u64) -> TensorData + Send + 'static {
    move |step| {
        if total_steps == 0 {
            return 0.0;
        }
        (1.0 - step as f64 / total_steps as f64).max(0.0) as TensorData
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{GroupConfig, OptimizerConfig, Scion};
    use crate::tensor;

    #[test]
    fn linear_decay_reaches_zero() {
        let f = linear_decay(4);
        assert_eq!(f(0), 1.0);
        assert_eq!(f(2), 0.5);
        assert_eq!(f(4), 0.0);
        assert_eq!(f(10), 0.0);
        assert_eq!(linear_decay(0)(0), 0.0);
    }

    #[test]
    fn lambda_lr_scales_every_group() {
        let specs = vec![
            GroupConfig::new("Sign").lr(0.4).with_params(vec![tensor::zeros(&[2], true)]),
            GroupConfig::new("L2").lr(0.2).with_params(vec![tensor::zeros(&[2], true)]),
        ];
        let mut opt = Scion::new(specs, OptimizerConfig::default()).unwrap();
        let mut sched = LambdaLr::new(&mut opt, linear_decay(4)).unwrap();
        assert_eq!(sched.last_factor(), 1.0);

        sched.step(&mut opt).unwrap();
        sched.step(&mut opt).unwrap();
        assert_eq!(sched.current_step(), 2);
        let lrs: Vec<_> = opt.param_groups().iter().map(|g| g.lr()).collect();
        assert_eq!(lrs, vec![0.2, 0.1]);

        for _ in 0..2 {
            sched.step(&mut opt).unwrap();
        }
        assert!(opt.param_groups().iter().all(|g| g.lr() == 0.0));
    }
}
