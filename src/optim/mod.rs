//! # Optimization Algorithms (`optim`)
//!
//! Norm-constrained optimizers built on linear minimization oracles:
//! [`Scion`] keeps its own momentum buffers, [`ScionLight`] reuses each
//! tensor's gradient slot. Both step over [`ParamGroup`]s, each carrying a
//! [`Norm`] policy and a radius scale.

use crate::error::Result;

// --- Submodules ---
pub mod config;
mod engine;
pub mod group;
pub mod norms;
pub mod scheduler;
pub mod scion;
pub mod scion_light;
pub mod state;

// Re-export optimizers
pub use config::OptimizerConfig;
pub use engine::Phase;
pub use group::{GroupConfig, GroupSpec, ParamGroup};
pub use norms::{KwargValue, Norm, NormKind, NormKwargs};
pub use scheduler::{linear_decay, LambdaLr, LrScheduler};
pub use scion::Scion;
pub use scion_light::ScionLight;
pub use state::{MomentumState, OptimizerState, Stateful};

// --- Optimizer Trait ---

/// Base trait for all optimizers.
pub trait Optimizer {
    /// Performs a single optimization step, updating parameters in place.
    /// Tensors without a gradient are skipped.
    fn step(&mut self) -> Result<()>;

    /// Clears the gradients of all managed parameters before the next batch.
    fn zero_grad(&mut self);

    fn param_groups(&self) -> &[ParamGroup];

    /// Mutable access for learning-rate schedules.
    fn param_groups_mut(&mut self) -> &mut [ParamGroup];
}
