//! Spectral-norm policies for matrices and convolution kernels.
//!
//! The LMO of the spectral norm ball is the polar factor `UVᵀ` of the
//! gradient. Two backends compute it: a converged cubic iteration (exact up
//! to tolerance, the default) and the fixed-step quintic Newton-Schulz
//! iteration (cheaper, singular values only land near 1).

use ndarray::{Array2, ArrayD, ArrayView2};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;

use super::KwargReader;
use crate::error::Result;
use crate::tensor::{ops, TensorData};

pub const DEFAULT_POLAR_ITERS: usize = 100;
pub const DEFAULT_NEWTON_STEPS: usize = 5;

/// How the polar factor of a matrix is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orthogonalizer {
    /// Cubic Newton-Schulz run until convergence, at most `max_iters` rounds.
    Polar { max_iters: usize },
    /// Quintic Newton-Schulz with a fixed number of steps.
    NewtonSchulz { steps: usize },
}

impl Default for Orthogonalizer {
    fn default() -> Self {
        Orthogonalizer::Polar {
            max_iters: DEFAULT_POLAR_ITERS,
        }
    }
}

impl Orthogonalizer {
    fn from_kwargs(reader: &mut KwargReader<'_>) -> Result<Self> {
        let backend = reader.choice("backend", &["polar", "newton"])?;
        let steps = reader.count("steps")?;
        Ok(match backend {
            Some("newton") => Orthogonalizer::NewtonSchulz {
                steps: steps.unwrap_or(DEFAULT_NEWTON_STEPS),
            },
            _ => Orthogonalizer::Polar {
                max_iters: steps.unwrap_or(DEFAULT_POLAR_ITERS),
            },
        })
    }

    pub fn apply(&self, g: ArrayView2<TensorData>) -> Array2<TensorData> {
        match *self {
            Orthogonalizer::Polar { max_iters } => ops::polar_factor(g, max_iters),
            Orthogonalizer::NewtonSchulz { steps } => ops::newton_schulz5(g, steps),
        }
    }
}

/// Options of the `Spectral` (and `Auto`) policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralOptions {
    /// Rescale `G` by its top singular value instead of orthogonalizing.
    pub max: bool,
    /// Radius `√(d_out/d_in)` instead of `√d_out`.
    pub normalized: bool,
    pub orthogonalizer: Orthogonalizer,
}

impl Default for SpectralOptions {
    fn default() -> Self {
        SpectralOptions {
            max: false,
            normalized: true,
            orthogonalizer: Orthogonalizer::default(),
        }
    }
}

impl SpectralOptions {
    pub(crate) fn from_kwargs(reader: &mut KwargReader<'_>) -> Result<Self> {
        Ok(SpectralOptions {
            max: reader.bool("max", false)?,
            normalized: reader.bool("normalized", true)?,
            orthogonalizer: Orthogonalizer::from_kwargs(reader)?,
        })
    }

    pub fn radius_factor(&self, d_out: usize, d_in: usize) -> TensorData {
        if self.normalized {
            (d_out as TensorData / d_in as TensorData).sqrt()
        } else {
            (d_out as TensorData).sqrt()
        }
    }
}

/// Options of the `SpectralConv` policy.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpectralConvOptions {
    pub orthogonalizer: Orthogonalizer,
}

impl SpectralConvOptions {
    pub(crate) fn from_kwargs(reader: &mut KwargReader<'_>) -> Result<Self> {
        Ok(SpectralConvOptions {
            orthogonalizer: Orthogonalizer::from_kwargs(reader)?,
        })
    }

    pub(crate) fn direction(&self, grad: &ArrayD<TensorData>) -> Result<ArrayD<TensorData>> {
        let m = ops::to_matrix(grad)?;
        Ok(ops::from_matrix(self.orthogonalizer.apply(m.view()), grad.shape())?)
    }

    /// `√(out/in) / (kh·kw)` for a kernel `[out, in, kh, kw]`.
    pub fn radius_factor(shape: &[usize]) -> TensorData {
        let (out, inp) = (shape[0] as TensorData, shape[1] as TensorData);
        let window = (shape[2] * shape[3]) as TensorData;
        (out / inp).sqrt() / window
    }
}

/// Direction of a matrix (or a tensor flattened to `[shape[0], rest]`).
pub(crate) fn matrix_direction(
    opts: &SpectralOptions,
    grad: &ArrayD<TensorData>,
) -> Result<ArrayD<TensorData>> {
    let m = ops::to_matrix(grad)?;
    let d = if opts.max {
        let sigma = ops::spectral_norm(m.view());
        m / sigma
    } else {
        opts.orthogonalizer.apply(m.view())
    };
    Ok(ops::from_matrix(d, grad.shape())?)
}

/// Orthogonal initialization: the polar factor of a Gaussian matrix.
pub(crate) fn orthogonal_init<R: Rng + ?Sized>(
    shape: &[usize],
    rng: &mut R,
) -> Result<ArrayD<TensorData>> {
    let rows = shape[0];
    let cols = shape[1..].iter().product();
    let g: Array2<TensorData> = Array2::random_using((rows, cols), StandardNormal, rng);
    let q = ops::polar_factor(g.view(), DEFAULT_POLAR_ITERS);
    Ok(ops::from_matrix(q, shape)?)
}
