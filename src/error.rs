//! # Error Types
//!
//! Crate-wide error taxonomy. Configuration and shape problems are raised
//! eagerly (at construction or at the first `step()`), never coerced, because a
//! silently wrong norm policy changes training dynamics without crashing.

use crate::optim::norms::NormKind;
use crate::tensor::TensorError;

#[derive(thiserror::Error, Debug)]
pub enum ScionError {
    /// Unknown norm kind, bad kwarg, out-of-range hyperparameter, duplicate tensor, ...
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Tensor rank/shape the chosen norm policy cannot handle.
    #[error("Shape error: norm {norm} cannot handle shape {shape:?}: {reason}")]
    Shape {
        norm: NormKind,
        shape: Vec<usize>,
        reason: &'static str,
    },
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
    /// A state snapshot that does not fit the optimizer it is loaded into.
    #[error("Incompatible optimizer state: {0}")]
    State(String),
    #[error("Invalid config document: {0}")]
    Document(#[from] serde_json::Error),
}

impl ScionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ScionError::Configuration(msg.into())
    }

    pub(crate) fn shape(norm: NormKind, shape: &[usize], reason: &'static str) -> Self {
        ScionError::Shape {
            norm,
            shape: shape.to_vec(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScionError>;
