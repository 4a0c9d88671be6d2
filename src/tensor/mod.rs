//! # Tensor Module
//!
//! This module defines the `Tensor` handle the optimizers operate on: shared
//! parameter storage, a gradient slot filled by the training loop, and a stable
//! identity used to key optimizer state.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// --- Submodules ---
pub mod grad;
pub mod ops;
pub mod storage;

// --- Re-exports ---
pub use grad::GradMode;
pub use storage::CpuStorage;

use grad::GradSlot;

// --- Error Handling ---
#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
    #[error("Gradient slot is already leased to an optimizer")]
    GradSlotLeased,
    #[error("Gradient for this step was already folded into the running average; use accumulate_grad")]
    GradientAlreadyFolded,
    #[error("Tensor is already tracked by an optimizer")]
    AlreadyTracked,
}

// Define a type alias for the underlying data type (e.g., f32)
pub type TensorData = f32;

/// Stable, process-unique identity of a tensor handle.
///
/// Clones of a [`Tensor`] share their id; optimizer state is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        TensorId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// # Tensor
///
/// A parameter handle: an `ndarray::ArrayD` behind a shared lock plus the
/// gradient slot the training loop writes into. Cloning is cheap and yields a
/// handle to the same data, gradient and identity.
#[derive(Clone, Debug)]
pub struct Tensor {
    id: TensorId,
    storage: CpuStorage,
    grad: Arc<RwLock<GradSlot>>,
    // Shape information (redundant with ndarray but useful for quick access)
    shape: Vec<usize>,
    requires_grad: bool,
}

impl Tensor {
    /// Creates a new Tensor from an ndarray::ArrayD.
    pub fn new(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            id: TensorId::next(),
            storage: CpuStorage::new(data),
            grad: Arc::new(RwLock::new(GradSlot::default())),
            shape,
            requires_grad,
        }
    }

    /// Creates a Tensor from a flat vector laid out in row-major order.
    pub fn from_shape_vec(
        shape: &[usize],
        values: Vec<TensorData>,
        requires_grad: bool,
    ) -> Result<Self, TensorError> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Tensor::new(data, requires_grad))
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Provides read-only access to the underlying data.
    pub fn data(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.storage.read_lock()
    }

    /// Provides mutable access to the underlying data.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.storage.write_lock()
    }

    /// Clones the underlying data into a new ArrayD.
    pub fn data_clone(&self) -> ArrayD<TensorData> {
        self.data().clone()
    }

    /// Overwrites the values in place (checkpoint loading, manual init).
    pub fn assign(&self, values: &ArrayD<TensorData>) -> Result<(), TensorError> {
        self.check_shape(values.shape())?;
        self.data_mut().assign(values);
        Ok(())
    }

    // --- Gradient slot ---

    fn grad_slot(&self) -> RwLockReadGuard<'_, GradSlot> {
        self.grad.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn grad_slot_mut(&self) -> RwLockWriteGuard<'_, GradSlot> {
        self.grad.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_shape(&self, got: &[usize]) -> Result<(), TensorError> {
        if got != self.shape.as_slice() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: got.to_vec(),
            });
        }
        Ok(())
    }

    /// Sets the gradient for this step, replacing whatever the slot holds.
    ///
    /// Ignored for tensors that do not require grad. On a leased slot the
    /// gradient is folded into the running average instead (see [`GradMode`]).
    pub fn set_grad(&self, grad: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Ok(());
        }
        self.check_shape(grad.shape())?;
        self.grad_slot_mut().receive(grad, true)
    }

    /// Accumulates gradient (micro-batching).
    pub fn accumulate_grad(&self, grad: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Ok(());
        }
        self.check_shape(grad.shape())?;
        self.grad_slot_mut().receive(grad, false)
    }

    /// Retrieves a copy of the gradient slot contents, if any.
    pub fn grad(&self) -> Option<ArrayD<TensorData>> {
        self.grad_slot().buffer().cloned()
    }

    /// True when a gradient arrived since the slot was last cleared or consumed.
    pub fn has_grad(&self) -> bool {
        self.grad_slot().is_pending()
    }

    /// Runs `f` on the gradient slot contents without copying them.
    pub fn with_grad<R>(&self, f: impl FnOnce(&ArrayD<TensorData>) -> R) -> Option<R> {
        self.grad_slot().buffer().map(f)
    }

    pub fn grad_mode(&self) -> GradMode {
        self.grad_slot().mode()
    }

    /// True while some optimizer holds this tensor in one of its groups.
    pub fn is_tracked(&self) -> bool {
        self.grad_slot().is_claimed()
    }

    /// Zeroes (drops) the gradient. Leased slots are left untouched because
    /// they hold an optimizer's running average.
    pub fn zero_grad(&self) {
        if !self.grad_slot_mut().clear() {
            log::trace!("zero_grad on {} skipped: gradient slot is leased", self.id);
        }
    }

    pub(crate) fn claim(&self) -> Result<(), TensorError> {
        self.grad_slot_mut().claim()
    }

    pub(crate) fn unclaim(&self) {
        self.grad_slot_mut().unclaim();
    }

    pub(crate) fn lease_grad_slot(&self, coeff: TensorData) -> Result<(), TensorError> {
        self.grad_slot_mut().lease(coeff)
    }

    pub(crate) fn release_grad_slot(&self) {
        self.grad_slot_mut().release();
    }

    pub(crate) fn consume_grad(&self) {
        self.grad_slot_mut().consume();
    }

    pub(crate) fn restore_grad_slot(
        &self,
        buf: Option<ArrayD<TensorData>>,
    ) -> Result<(), TensorError> {
        if let Some(buf) = &buf {
            self.check_shape(buf.shape())?;
        }
        self.grad_slot_mut().restore(buf);
        Ok(())
    }
}

// --- Helper functions ---

/// Helper to create a tensor filled with zeros.
pub fn zeros(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor with standard-normal values from `rng`.
pub fn randn_using<R: Rng + ?Sized>(shape: &[usize], requires_grad: bool, rng: &mut R) -> Tensor {
    let data = ArrayD::random_using(IxDyn(shape), StandardNormal, rng);
    Tensor::new(data, requires_grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn clones_share_identity_data_and_grad() {
        let t = zeros(&[2, 2], true);
        let alias = t.clone();
        assert_eq!(t.id(), alias.id());

        alias.data_mut()[[0, 1]] = 3.0;
        assert_eq!(t.data()[[0, 1]], 3.0);

        alias.set_grad(&arr2(&[[1.0, 1.0], [1.0, 1.0]]).into_dyn()).unwrap();
        assert!(t.has_grad());
        assert_ne!(t.id(), zeros(&[2, 2], true).id());
    }

    #[test]
    fn gradient_shape_is_checked() {
        let t = zeros(&[2, 3], true);
        let err = t.set_grad(&ArrayD::zeros(IxDyn(&[3, 2]))).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn frozen_tensor_ignores_gradients() {
        let t = zeros(&[3], false);
        t.set_grad(&ArrayD::ones(IxDyn(&[3]))).unwrap();
        assert!(t.grad().is_none());
    }

    #[test]
    fn zero_grad_drops_plain_gradient() {
        let t = zeros(&[3], true);
        t.accumulate_grad(&ArrayD::ones(IxDyn(&[3]))).unwrap();
        t.accumulate_grad(&ArrayD::ones(IxDyn(&[3]))).unwrap();
        assert_eq!(t.grad().unwrap(), ArrayD::from_elem(IxDyn(&[3]), 2.0));
        t.zero_grad();
        assert!(t.grad().is_none());
        assert!(!t.has_grad());
    }
}
