//! # Tensor Storage
//!
//! Defines the underlying memory storage for Tensors.
//! Currently, this uses `ndarray::ArrayD` for CPU storage.

use ndarray::ArrayD;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::TensorData;

/// Represents the CPU memory backing a Tensor.
///
/// It wraps the actual `ndarray` array within synchronization primitives
/// (`Arc<RwLock<...>>`) so the model and the optimizer can hold handles to
/// the same parameter values.
#[derive(Debug, Clone)]
pub struct CpuStorage {
    pub(crate) data: Arc<RwLock<ArrayD<TensorData>>>,
}

impl CpuStorage {
    /// Creates a new `CpuStorage` instance from an existing `ndarray::ArrayD`.
    pub fn new(array_data: ArrayD<TensorData>) -> Self {
        CpuStorage {
            data: Arc::new(RwLock::new(array_data)),
        }
    }

    /// Provides read access to the underlying `ndarray`.
    ///
    /// A poisoned lock is recovered: the array is plain numeric data and stays
    /// structurally valid even if a writer panicked mid-update.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provides write access to the underlying `ndarray`.
    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}
