//! Max-norm (`ℓ∞`) policy. Its LMO is the elementwise sign.

use ndarray::{ArrayD, IxDyn};
use rand::Rng;

use super::KwargReader;
use crate::error::Result;
use crate::tensor::{ops, TensorData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignOptions {
    /// Divide the sign pattern by `√n` so its RMS is 1 regardless of size.
    pub normalized: bool,
    /// Reinitialize to zeros instead of random signs.
    pub zero_init: bool,
}

impl Default for SignOptions {
    fn default() -> Self {
        SignOptions {
            normalized: true,
            zero_init: false,
        }
    }
}

impl SignOptions {
    pub(crate) fn from_kwargs(reader: &mut KwargReader<'_>) -> Result<Self> {
        Ok(SignOptions {
            normalized: reader.bool("normalized", true)?,
            zero_init: reader.bool("zero_init", false)?,
        })
    }

    fn size_factor(&self, len: usize) -> TensorData {
        if self.normalized {
            (len as TensorData).sqrt()
        } else {
            1.0
        }
    }

    pub(crate) fn direction(&self, grad: &ArrayD<TensorData>) -> ArrayD<TensorData> {
        let factor = self.size_factor(grad.len());
        grad.mapv(|x| ops::sign(x) / factor)
    }

    pub(crate) fn norm(&self, x: &ArrayD<TensorData>) -> TensorData {
        ops::max_abs(x) * self.size_factor(x.len())
    }

    pub(crate) fn random_unit_point<R: Rng + ?Sized>(
        &self,
        shape: &[usize],
        rng: &mut R,
    ) -> ArrayD<TensorData> {
        if self.zero_init {
            return ArrayD::zeros(IxDyn(shape));
        }
        let magnitude = 1.0 / self.size_factor(shape.iter().product());
        ArrayD::from_shape_fn(IxDyn(shape), |_| {
            if rng.gen::<bool>() {
                magnitude
            } else {
                -magnitude
            }
        })
    }
}
