//! # Gradient Slot
//!
//! Every tensor carries one gradient slot. By default the slot behaves like a
//! PyTorch `.grad`: incoming gradients are summed and `zero_grad` clears it.
//!
//! An optimizer may instead *lease* the slot ([`GradMode::Averaged`]). From then
//! on the slot stores the optimizer's running momentum average and incoming
//! gradients are folded into it in place, so no second buffer per parameter is
//! ever allocated.

use ndarray::ArrayD;

use super::{ops, TensorData, TensorError};

/// Capability flag describing how a tensor's gradient slot is used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradMode {
    /// Gradients are summed into the slot; `zero_grad` clears it.
    Accumulate,
    /// The slot is leased to an optimizer as an exponential moving average.
    ///
    /// `coeff` follows the Scion convention: it is the weight of the *fresh*
    /// gradient (`1 - classical_momentum`), so `0.1` means heavy averaging.
    Averaged { coeff: TensorData },
}

#[derive(Debug)]
pub(crate) struct GradSlot {
    buf: Option<ArrayD<TensorData>>,
    mode: GradMode,
    /// A gradient arrived since the slot was last consumed by a step.
    pending: bool,
    /// The buffer was started from scratch in the current pending window and
    /// still holds a plain gradient sum rather than an average.
    fresh: bool,
    /// The tensor is tracked by an optimizer.
    claimed: bool,
}

impl Default for GradSlot {
    fn default() -> Self {
        GradSlot {
            buf: None,
            mode: GradMode::Accumulate,
            pending: false,
            fresh: false,
            claimed: false,
        }
    }
}

impl GradSlot {
    pub(crate) fn mode(&self) -> GradMode {
        self.mode
    }

    pub(crate) fn buffer(&self) -> Option<&ArrayD<TensorData>> {
        self.buf.as_ref()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed
    }

    pub(crate) fn claim(&mut self) -> Result<(), TensorError> {
        if self.claimed {
            return Err(TensorError::AlreadyTracked);
        }
        self.claimed = true;
        Ok(())
    }

    pub(crate) fn unclaim(&mut self) {
        self.claimed = false;
    }

    /// Receives a gradient.
    ///
    /// `overwrite` replaces the current contents in `Accumulate` mode. In
    /// `Averaged` mode a gradient can only be folded in. An empty slot starts
    /// a plain sum that takes every micro-batch at full weight until the next
    /// step. Otherwise the first gradient after a step is blended with weight
    /// `coeff` and further micro-batches add `coeff * g`.
    pub(crate) fn receive(
        &mut self,
        grad: &ArrayD<TensorData>,
        overwrite: bool,
    ) -> Result<(), TensorError> {
        match self.mode {
            GradMode::Accumulate => match self.buf.as_mut() {
                Some(buf) if !overwrite => *buf += grad,
                _ => self.buf = Some(grad.clone()),
            },
            GradMode::Averaged { coeff } => match self.buf.as_mut() {
                None => {
                    self.buf = Some(grad.clone());
                    self.fresh = true;
                }
                Some(_) if self.pending && overwrite => {
                    return Err(TensorError::GradientAlreadyFolded)
                }
                Some(buf) if self.pending && self.fresh => *buf += grad,
                Some(buf) if self.pending => buf.scaled_add(coeff, grad),
                Some(buf) => ops::lerp_into(buf, grad, coeff),
            },
        }
        self.pending = true;
        Ok(())
    }

    /// Clears the slot. Leased slots keep their running average.
    pub(crate) fn clear(&mut self) -> bool {
        match self.mode {
            GradMode::Accumulate => {
                self.buf = None;
                self.pending = false;
                self.fresh = false;
                true
            }
            GradMode::Averaged { .. } => false,
        }
    }

    /// Marks the current contents as consumed by an optimizer step.
    pub(crate) fn consume(&mut self) {
        self.pending = false;
        self.fresh = false;
    }

    pub(crate) fn lease(&mut self, coeff: TensorData) -> Result<(), TensorError> {
        if let GradMode::Averaged { .. } = self.mode {
            return Err(TensorError::GradSlotLeased);
        }
        // A gradient already sitting in the slot becomes the initial average.
        self.mode = GradMode::Averaged { coeff };
        self.fresh = self.pending;
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        self.mode = GradMode::Accumulate;
        self.buf = None;
        self.pending = false;
        self.fresh = false;
    }

    /// Replaces the slot contents with a checkpointed running average
    /// (`None` starts the average afresh at the next gradient).
    pub(crate) fn restore(&mut self, buf: Option<ArrayD<TensorData>>) {
        self.buf = buf;
        self.pending = false;
        self.fresh = false;
    }
}
