//! Policies that rescale whole tensors (`BiasRMS`, `L2`) or individual
//! rows/columns (`ColNorm`, `RowNorm`).

use ndarray::{Array2, ArrayD, Axis, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;

use super::KwargReader;
use crate::error::Result;
use crate::tensor::{ops, TensorData};

pub(crate) fn rms_direction(grad: &ArrayD<TensorData>) -> ArrayD<TensorData> {
    grad / ops::rms(grad)
}

pub(crate) fn l2_direction(grad: &ArrayD<TensorData>) -> ArrayD<TensorData> {
    grad / ops::frobenius_norm(grad)
}

/// Gaussian sample scaled onto the Euclidean unit sphere.
pub(crate) fn unit_gaussian<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<TensorData> {
    let g = ArrayD::random_using(IxDyn(shape), StandardNormal, rng);
    l2_direction(&g)
}

/// Options shared by `ColNorm` and `RowNorm`.
///
/// Columns are the lanes along axis 0 (one per input feature), rows the lanes
/// along axis 1 (one per output feature, e.g. an embedding vector). With
/// `transpose` the policy acts on `Gᵀ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisNormOptions {
    /// Scale each lane's RMS by the lane count.
    pub normalized: bool,
    pub transpose: bool,
}

impl AxisNormOptions {
    pub(crate) fn from_kwargs(
        reader: &mut KwargReader<'_>,
        default_normalized: bool,
    ) -> Result<Self> {
        Ok(AxisNormOptions {
            normalized: reader.bool("normalized", default_normalized)?,
            transpose: reader.bool("transpose", false)?,
        })
    }

    fn oriented(&self, x: &ArrayD<TensorData>) -> Result<Array2<TensorData>> {
        let m = ops::to_matrix(x)?;
        Ok(if self.transpose { m.reversed_axes() } else { m })
    }

    fn restore(&self, m: Array2<TensorData>, shape: &[usize]) -> Result<ArrayD<TensorData>> {
        let m = if self.transpose { m.reversed_axes() } else { m };
        Ok(ops::from_matrix(m, shape)?)
    }

    fn factor(&self, m: &Array2<TensorData>, rows: bool) -> TensorData {
        match (self.normalized, rows) {
            (false, _) => 1.0,
            (true, true) => m.nrows() as TensorData,
            (true, false) => m.ncols() as TensorData,
        }
    }

    pub(crate) fn direction(
        &self,
        grad: &ArrayD<TensorData>,
        rows: bool,
    ) -> Result<ArrayD<TensorData>> {
        let mut m = self.oriented(grad)?;
        let factor = self.factor(&m, rows);
        normalize_lanes(&mut m, rows, factor);
        self.restore(m, grad.shape())
    }

    pub(crate) fn norm(&self, x: &ArrayD<TensorData>, rows: bool) -> Result<TensorData> {
        let m = self.oriented(x)?;
        Ok(max_lane_rms(&m, rows) * self.factor(&m, rows))
    }

    pub(crate) fn random_unit_point<R: Rng + ?Sized>(
        &self,
        shape: &[usize],
        rng: &mut R,
        rows: bool,
    ) -> Result<ArrayD<TensorData>> {
        let g = ArrayD::random_using(IxDyn(shape), StandardNormal, rng);
        self.direction(&g, rows)
    }
}

fn lane_axis(rows: bool) -> Axis {
    if rows {
        Axis(0)
    } else {
        Axis(1)
    }
}

/// Divides every lane by `factor * rms(lane)`. All-zero lanes stay zero.
pub fn normalize_lanes(m: &mut Array2<TensorData>, rows: bool, factor: TensorData) {
    for mut lane in m.axis_iter_mut(lane_axis(rows)) {
        let rms = ops::rms(&lane);
        if rms > 0.0 {
            let divisor = factor * rms;
            lane.mapv_inplace(|x| x / divisor);
        }
    }
}

pub fn max_lane_rms(m: &Array2<TensorData>, rows: bool) -> TensorData {
    m.axis_iter(lane_axis(rows))
        .map(|lane| ops::rms(&lane))
        .fold(0.0, TensorData::max)
}
