//! # Scion Core Library
//!
//! Norm-constrained optimizers for training deep networks. Every parameter
//! group picks a norm (spectral, sign, RMS, ...) and a radius; each step moves
//! the parameters toward the point of the norm ball that is most aligned
//! against the momentum, so weights stay bounded throughout training.
//!
//! The crate carries its own minimal [`Tensor`](tensor::Tensor) handle: shared
//! `ndarray` storage plus a gradient slot the training loop fills.

pub mod error;
pub mod optim;
pub mod tensor;

pub use error::{Result, ScionError};
pub use optim::{
    GroupConfig, GroupSpec, Norm, NormKind, Optimizer, OptimizerConfig, Scion, ScionLight,
    Stateful,
};
pub use tensor::{Tensor, TensorData};
