//! # Tensor Operations
//!
//! Numeric kernels behind the norm policies: reductions, matrix reshaping,
//! spectral norm estimation and the two orthogonalization schemes.

use ndarray::{Array1, Array2, ArrayBase, ArrayD, ArrayView2, Data, Dimension, IxDyn, Zip};

use super::{TensorData, TensorError};

/// Quintic Newton-Schulz coefficients, tuned to push all singular values
/// into a band around 1 in very few iterations.
const NS5_COEFFS: (TensorData, TensorData, TensorData) = (3.4445, -4.7750, 2.0315);
/// Relative step size at which the cubic polar iteration stops.
const POLAR_TOLERANCE: TensorData = 1e-6;
const POWER_ITERATIONS: usize = 200;
const POWER_TOLERANCE: TensorData = 1e-7;

// --- Elementwise / reductions ---

/// Sign with `sign(0) == 0`; NaN stays NaN.
pub fn sign(x: TensorData) -> TensorData {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        x
    }
}

/// Frobenius (flat L2) norm, accumulated in f64.
pub fn frobenius_norm<S, D>(a: &ArrayBase<S, D>) -> TensorData
where
    S: Data<Elem = TensorData>,
    D: Dimension,
{
    a.iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt() as TensorData
}

/// Root mean square of all elements (0 for an empty array).
pub fn rms<S, D>(a: &ArrayBase<S, D>) -> TensorData
where
    S: Data<Elem = TensorData>,
    D: Dimension,
{
    if a.is_empty() {
        return 0.0;
    }
    frobenius_norm(a) / (a.len() as TensorData).sqrt()
}

/// Largest absolute value; NaN if any element is NaN.
pub fn max_abs<S, D>(a: &ArrayBase<S, D>) -> TensorData
where
    S: Data<Elem = TensorData>,
    D: Dimension,
{
    a.iter()
        .map(|x| x.abs())
        .fold(0.0, |acc, x| if x > acc || x.is_nan() { x } else { acc })
}

/// `buf <- (1 - weight) * buf + weight * target`, in place.
///
/// This is the single place the momentum average is computed, so every
/// optimizer variant produces bit-identical buffers.
pub fn lerp_into(buf: &mut ArrayD<TensorData>, target: &ArrayD<TensorData>, weight: TensorData) {
    let keep = 1.0 - weight;
    Zip::from(buf)
        .and(target)
        .for_each(|b, &t| *b = keep * *b + weight * t);
}

// --- Matrix views ---

/// Flattens a tensor into `(shape[0], product(shape[1..]))`.
pub fn to_matrix(a: &ArrayD<TensorData>) -> Result<Array2<TensorData>, TensorError> {
    let rows = a.shape().first().copied().unwrap_or(1);
    let cols = if rows == 0 { 0 } else { a.len() / rows };
    Ok(a.as_standard_layout().into_owned().into_shape((rows, cols))?)
}

/// Inverse of [`to_matrix`]: restores the original tensor shape.
pub fn from_matrix(m: Array2<TensorData>, shape: &[usize]) -> Result<ArrayD<TensorData>, TensorError> {
    // into_shape follows memory order, so force row-major first.
    Ok(m.as_standard_layout().into_owned().into_shape(IxDyn(shape))?)
}

// --- Spectral kernels ---

/// Largest singular value via power iteration on `GᵀG`.
///
/// A start vector orthogonal to the top right singular vector never leaves
/// the wrong subspace, so two unrelated starts are run and the larger
/// estimate wins: the heaviest row of `G` and a dense quasi-random vector.
pub fn spectral_norm(m: ArrayView2<TensorData>) -> TensorData {
    let heaviest = match m
        .rows()
        .into_iter()
        .max_by(|a, b| frobenius_norm(a).total_cmp(&frobenius_norm(b)))
    {
        Some(row) => row.to_owned(),
        None => return 0.0,
    };
    // Golden-ratio offsets keep the dense start free of sign patterns.
    let dense = Array1::from_shape_fn(m.ncols(), |j| 1.0 + (j as TensorData * 0.618_034).fract());
    power_iterate(m, heaviest).max(power_iterate(m, dense))
}

fn power_iterate(m: ArrayView2<TensorData>, mut v: Array1<TensorData>) -> TensorData {
    let mut sigma = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let n = frobenius_norm(&v);
        if n == 0.0 || !n.is_finite() {
            return if n == 0.0 { sigma } else { n };
        }
        v /= n;
        let u = m.dot(&v);
        let next = frobenius_norm(&u);
        v = m.t().dot(&u);
        let converged = (next - sigma).abs() <= POWER_TOLERANCE * next;
        sigma = next;
        if converged {
            break;
        }
    }
    sigma
}

/// Approximate orthogonalization `G -> UVᵀ` with a fixed number of quintic
/// Newton-Schulz iterations. Singular values land near, not exactly at, 1.
pub fn newton_schulz5(g: ArrayView2<TensorData>, steps: usize) -> Array2<TensorData> {
    let (a, b, c) = NS5_COEFFS;
    let tall = g.nrows() > g.ncols();
    let mut x = if tall { g.t().to_owned() } else { g.to_owned() };
    x /= frobenius_norm(&x) + 1e-7;
    for _ in 0..steps {
        let gram = x.dot(&x.t());
        let poly = &gram * b + &gram.dot(&gram) * c;
        x = &x * a + &poly.dot(&x);
    }
    if tall {
        x.reversed_axes()
    } else {
        x
    }
}

/// Polar factor `UVᵀ` of `G = UΣVᵀ` via the cubic Newton-Schulz iteration
/// `X <- 1.5X - 0.5XXᵀX`, run until the update stalls or `max_iters` is hit.
///
/// Starting from `G / ‖G‖_F` every singular value lies in (0, 1] and stays
/// there, so the result never has spectral norm above 1. Zero singular values
/// stay zero.
pub fn polar_factor(g: ArrayView2<TensorData>, max_iters: usize) -> Array2<TensorData> {
    let tall = g.nrows() > g.ncols();
    let mut x = if tall { g.t().to_owned() } else { g.to_owned() };
    let norm = frobenius_norm(&x);
    if norm == 0.0 {
        return Array2::zeros(g.raw_dim());
    }
    x /= norm;
    for _ in 0..max_iters {
        let next = &x * 1.5 - &x.dot(&x.t()).dot(&x) * 0.5;
        let change = frobenius_norm(&(&next - &x));
        let scale = frobenius_norm(&next);
        x = next;
        if change <= POLAR_TOLERANCE * scale {
            break;
        }
    }
    if tall {
        x.reversed_axes()
    } else {
        x
    }
}
