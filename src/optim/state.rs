//! # Momentum State and Checkpoints
//!
//! `MomentumState` owns the per-tensor running averages of [`Scion`]. The
//! `Stateful` trait exports and restores optimizer state as a plain,
//! serde-serializable snapshot; choosing a file format is left to the caller.
//!
//! [`Scion`]: super::Scion

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::tensor::{ops, TensorData, TensorError, TensorId};

/// Running momentum averages keyed by tensor identity.
#[derive(Debug, Default, Clone)]
pub struct MomentumState {
    buffers: HashMap<TensorId, ArrayD<TensorData>>,
}

impl MomentumState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `grad` into the buffer of `id` and returns the updated buffer.
    ///
    /// The first gradient seen for a tensor is copied as is; afterwards
    /// `m <- (1 - momentum) m + momentum g`.
    pub fn update(
        &mut self,
        id: TensorId,
        grad: &ArrayD<TensorData>,
        momentum: TensorData,
    ) -> &ArrayD<TensorData> {
        match self.buffers.entry(id) {
            Entry::Occupied(entry) => {
                let buf = entry.into_mut();
                ops::lerp_into(buf, grad, momentum);
                buf
            }
            Entry::Vacant(entry) => entry.insert(grad.clone()),
        }
    }

    pub fn get(&self, id: TensorId) -> Option<&ArrayD<TensorData>> {
        self.buffers.get(&id)
    }

    pub(crate) fn insert(&mut self, id: TensorId, buf: ArrayD<TensorData>) {
        self.buffers.insert(id, buf);
    }

    pub fn remove(&mut self, id: TensorId) -> Option<ArrayD<TensorData>> {
        self.buffers.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

// --- Snapshots ---

/// A buffer flattened to row-major values plus its shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SerializableBuffer {
    pub shape: Vec<usize>,
    pub data: Vec<TensorData>,
}

impl SerializableBuffer {
    pub fn from_array(array: &ArrayD<TensorData>) -> Self {
        SerializableBuffer {
            shape: array.shape().to_vec(),
            // iter() walks logical order regardless of memory layout
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> std::result::Result<ArrayD<TensorData>, TensorError> {
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())?)
    }
}

/// Serializable optimizer snapshot.
///
/// Momentum buffers are keyed `"{group}.{index}"` by the position of the
/// tensor in the optimizer's groups; tensors without a buffer are absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OptimizerState {
    /// Name of the optimizer that produced the snapshot.
    pub optimizer_type: String,
    /// Number of completed steps.
    pub steps: u64,
    /// Current learning rate of each group.
    pub group_lrs: Vec<TensorData>,
    pub buffers: BTreeMap<String, SerializableBuffer>,
}

impl OptimizerState {
    pub fn new(optimizer_type: impl Into<String>) -> Self {
        OptimizerState {
            optimizer_type: optimizer_type.into(),
            steps: 0,
            group_lrs: Vec::new(),
            buffers: BTreeMap::new(),
        }
    }

    pub fn buffer_key(group: usize, index: usize) -> String {
        format!("{group}.{index}")
    }

    pub fn set_buffer(&mut self, group: usize, index: usize, buf: &ArrayD<TensorData>) {
        self.buffers
            .insert(Self::buffer_key(group, index), SerializableBuffer::from_array(buf));
    }

    pub fn get_buffer(&self, group: usize, index: usize) -> Option<&SerializableBuffer> {
        self.buffers.get(&Self::buffer_key(group, index))
    }
}

/// Optimizers that can export and restore their internal state, so training
/// resumes exactly where it left off.
pub trait Stateful {
    fn state_dict(&self) -> OptimizerState;

    /// Restores a snapshot. Fails without modifying anything if the snapshot
    /// does not match this optimizer's groups and tensor shapes.
    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()>;
}
