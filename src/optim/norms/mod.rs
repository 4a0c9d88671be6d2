//! # Norm Registry
//!
//! Each norm policy answers three questions for a tensor shape:
//!
//! * `direction(g)` — the unit-norm steepest-ascent direction `d` of `g` under
//!   the policy's norm. The linear minimization oracle over the unit ball is
//!   `-d`, so `<g, -d>` is as negative as the ball allows.
//! * `radius(scale, shape)` — the radius `r` of the group's ball for that
//!   shape. Shape-dependent factors live here so one `scale` transfers across
//!   layer widths.
//! * `norm(x)` — the policy's norm itself, with `norm(direction(g)) == 1`.
//!
//! Policies are selected by a string tag plus keyword options (the external
//! configuration surface) and parsed once into the typed [`Norm`] enum.

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, ScionError};
use crate::tensor::{ops, TensorData};

// --- Submodules ---
pub mod elementwise;
pub mod sign;
pub mod spectral;

pub use elementwise::AxisNormOptions;
pub use sign::SignOptions;
pub use spectral::{Orthogonalizer, SpectralConvOptions, SpectralOptions};

/// Inputs with a Frobenius norm below this map to a zero direction.
pub const DEGENERATE_NORM: TensorData = 1e-12;

// --- Norm kinds ---

/// String tags accepted in group configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormKind {
    Spectral,
    SpectralConv,
    Sign,
    Auto,
    BiasRms,
    L2,
    ColNorm,
    RowNorm,
}

impl NormKind {
    pub const ALL: [NormKind; 8] = [
        NormKind::Spectral,
        NormKind::SpectralConv,
        NormKind::Sign,
        NormKind::Auto,
        NormKind::BiasRms,
        NormKind::L2,
        NormKind::ColNorm,
        NormKind::RowNorm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NormKind::Spectral => "Spectral",
            NormKind::SpectralConv => "SpectralConv",
            NormKind::Sign => "Sign",
            NormKind::Auto => "Auto",
            NormKind::BiasRms => "BiasRMS",
            NormKind::L2 => "L2",
            NormKind::ColNorm => "ColNorm",
            NormKind::RowNorm => "RowNorm",
        }
    }
}

impl fmt::Display for NormKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NormKind {
    type Err = ScionError;

    fn from_str(s: &str) -> Result<Self> {
        NormKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = NormKind::ALL.iter().map(NormKind::as_str).collect();
                ScionError::config(format!(
                    "unknown norm kind `{s}` (expected one of: {})",
                    known.join(", ")
                ))
            })
    }
}

// --- Keyword options ---

/// A loosely typed option value as it appears in a config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KwargValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for KwargValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KwargValue::Bool(b) => write!(f, "{b}"),
            KwargValue::Int(i) => write!(f, "{i}"),
            KwargValue::Float(x) => write!(f, "{x}"),
            KwargValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for KwargValue {
    fn from(v: bool) -> Self {
        KwargValue::Bool(v)
    }
}

impl From<i64> for KwargValue {
    fn from(v: i64) -> Self {
        KwargValue::Int(v)
    }
}

impl From<i32> for KwargValue {
    fn from(v: i32) -> Self {
        KwargValue::Int(i64::from(v))
    }
}

impl From<f64> for KwargValue {
    fn from(v: f64) -> Self {
        KwargValue::Float(v)
    }
}

impl From<&str> for KwargValue {
    fn from(v: &str) -> Self {
        KwargValue::Str(v.to_string())
    }
}

impl From<String> for KwargValue {
    fn from(v: String) -> Self {
        KwargValue::Str(v)
    }
}

pub type NormKwargs = BTreeMap<String, KwargValue>;

/// Typed reader over a kwargs map; rejects ill-typed values and, on
/// `finish`, any key no reader asked for.
pub(crate) struct KwargReader<'a> {
    kind: NormKind,
    kwargs: &'a NormKwargs,
    seen: BTreeSet<&'static str>,
}

impl<'a> KwargReader<'a> {
    pub(crate) fn new(kind: NormKind, kwargs: &'a NormKwargs) -> Self {
        KwargReader {
            kind,
            kwargs,
            seen: BTreeSet::new(),
        }
    }

    fn lookup(&mut self, name: &'static str) -> Option<&'a KwargValue> {
        self.seen.insert(name);
        self.kwargs.get(name)
    }

    fn invalid(&self, name: &str, value: &KwargValue, expected: &str) -> ScionError {
        ScionError::config(format!(
            "norm {}: kwarg `{name}` must be {expected}, got {value}",
            self.kind
        ))
    }

    pub(crate) fn bool(&mut self, name: &'static str, default: bool) -> Result<bool> {
        match self.lookup(name) {
            None => Ok(default),
            Some(KwargValue::Bool(b)) => Ok(*b),
            Some(other) => Err(self.invalid(name, other, "a bool")),
        }
    }

    pub(crate) fn count(&mut self, name: &'static str) -> Result<Option<usize>> {
        match self.lookup(name) {
            None => Ok(None),
            Some(KwargValue::Int(i)) if *i > 0 => Ok(Some(*i as usize)),
            Some(other) => Err(self.invalid(name, other, "a positive integer")),
        }
    }

    pub(crate) fn choice(
        &mut self,
        name: &'static str,
        options: &[&'static str],
    ) -> Result<Option<&'static str>> {
        let value = match self.lookup(name) {
            None => return Ok(None),
            Some(value) => value,
        };
        let picked = match value {
            KwargValue::Str(s) => options.iter().copied().find(|opt| *opt == s.as_str()),
            _ => None,
        };
        picked
            .map(Some)
            .ok_or_else(|| self.invalid(name, value, &format!("one of {options:?}")))
    }

    pub(crate) fn finish(self) -> Result<()> {
        match self.kwargs.keys().find(|k| !self.seen.contains(k.as_str())) {
            Some(unknown) => Err(ScionError::config(format!(
                "norm {} does not accept kwarg `{unknown}`",
                self.kind
            ))),
            None => Ok(()),
        }
    }
}

// --- Norm policies ---

/// A parsed norm policy with its typed options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Norm {
    /// Operator norm of a matrix; LMO via the polar factor `UVᵀ`.
    Spectral(SpectralOptions),
    /// Spectral norm of a conv kernel `[out, in, kh, kw]` flattened to `[out, in*kh*kw]`.
    SpectralConv(SpectralConvOptions),
    /// Max-norm; LMO via the elementwise sign.
    Sign(SignOptions),
    /// Spectral for rank >= 2 (trailing dims flattened), BiasRMS otherwise.
    Auto(SpectralOptions),
    /// RMS norm of a whole vector (biases, gains).
    BiasRms,
    /// Euclidean norm of the flattened tensor.
    L2,
    /// Max over columns of the column RMS.
    ColNorm(AxisNormOptions),
    /// Max over rows of the row RMS (embeddings).
    RowNorm(AxisNormOptions),
}

impl Default for Norm {
    fn default() -> Self {
        Norm::Auto(SpectralOptions::default())
    }
}

impl Norm {
    /// Parses a string tag plus kwargs, e.g. `("Spectral", {"max": true})`.
    pub fn parse(name: &str, kwargs: &NormKwargs) -> Result<Norm> {
        Norm::from_kwargs(name.parse()?, kwargs)
    }

    pub fn from_kwargs(kind: NormKind, kwargs: &NormKwargs) -> Result<Norm> {
        let mut reader = KwargReader::new(kind, kwargs);
        let norm = match kind {
            NormKind::Spectral => Norm::Spectral(SpectralOptions::from_kwargs(&mut reader)?),
            NormKind::SpectralConv => {
                Norm::SpectralConv(SpectralConvOptions::from_kwargs(&mut reader)?)
            }
            NormKind::Sign => Norm::Sign(SignOptions::from_kwargs(&mut reader)?),
            NormKind::Auto => Norm::Auto(SpectralOptions::from_kwargs(&mut reader)?),
            NormKind::BiasRms => Norm::BiasRms,
            NormKind::L2 => Norm::L2,
            NormKind::ColNorm => Norm::ColNorm(AxisNormOptions::from_kwargs(&mut reader, false)?),
            NormKind::RowNorm => Norm::RowNorm(AxisNormOptions::from_kwargs(&mut reader, true)?),
        };
        reader.finish()?;
        Ok(norm)
    }

    pub fn kind(&self) -> NormKind {
        match self {
            Norm::Spectral(_) => NormKind::Spectral,
            Norm::SpectralConv(_) => NormKind::SpectralConv,
            Norm::Sign(_) => NormKind::Sign,
            Norm::Auto(_) => NormKind::Auto,
            Norm::BiasRms => NormKind::BiasRms,
            Norm::L2 => NormKind::L2,
            Norm::ColNorm(_) => NormKind::ColNorm,
            Norm::RowNorm(_) => NormKind::RowNorm,
        }
    }

    /// Fails with a shape error if this policy cannot handle `shape`.
    pub fn check_shape(&self, shape: &[usize]) -> Result<()> {
        let err = |reason| Err(ScionError::shape(self.kind(), shape, reason));
        let has_zero_dim = shape.contains(&0);
        match self {
            Norm::Spectral(_) | Norm::ColNorm(_) | Norm::RowNorm(_) if shape.len() != 2 => {
                err("expected a 2-D matrix")
            }
            Norm::SpectralConv(_) if shape.len() != 4 => {
                err("expected a 4-D conv kernel [out, in, kh, kw]")
            }
            Norm::Spectral(_) | Norm::SpectralConv(_) | Norm::ColNorm(_) | Norm::RowNorm(_)
                if has_zero_dim =>
            {
                err("zero-sized dimension")
            }
            Norm::Auto(_) if shape.len() >= 2 && has_zero_dim => err("zero-sized dimension"),
            Norm::Sign(opts) if opts.normalized && shape.is_empty() => {
                err("normalized sign needs at least one dimension")
            }
            _ => Ok(()),
        }
    }

    /// Unit-norm steepest-ascent direction of `grad` (zero for a degenerate input).
    pub fn direction(&self, grad: &ArrayD<TensorData>) -> Result<ArrayD<TensorData>> {
        self.check_shape(grad.shape())?;
        if ops::frobenius_norm(grad) < DEGENERATE_NORM {
            return Ok(ArrayD::zeros(grad.raw_dim()));
        }
        let shape = grad.shape();
        let direction = match self {
            Norm::Spectral(opts) => spectral::matrix_direction(opts, grad)?,
            Norm::Auto(opts) if shape.len() >= 2 => spectral::matrix_direction(opts, grad)?,
            Norm::SpectralConv(opts) => opts.direction(grad)?,
            Norm::Sign(opts) => opts.direction(grad),
            Norm::Auto(_) | Norm::BiasRms => elementwise::rms_direction(grad),
            Norm::L2 => elementwise::l2_direction(grad),
            Norm::ColNorm(opts) => opts.direction(grad, false)?,
            Norm::RowNorm(opts) => opts.direction(grad, true)?,
        };
        Ok(direction)
    }

    /// Radius of the norm ball for a tensor of `shape` in a group with `scale`.
    pub fn radius(&self, scale: TensorData, shape: &[usize]) -> Result<TensorData> {
        self.check_shape(shape)?;
        let factor = match self {
            Norm::Spectral(opts) => opts.radius_factor(shape[0], shape[1]),
            Norm::Auto(opts) if shape.len() >= 2 => {
                opts.radius_factor(shape[0], shape[1..].iter().product())
            }
            Norm::SpectralConv(_) => SpectralConvOptions::radius_factor(shape),
            _ => 1.0,
        };
        Ok(scale * factor)
    }

    /// The policy's norm of `x`.
    pub fn norm(&self, x: &ArrayD<TensorData>) -> Result<TensorData> {
        self.check_shape(x.shape())?;
        let value = match self {
            Norm::Spectral(_) | Norm::SpectralConv(_) => {
                ops::spectral_norm(ops::to_matrix(x)?.view())
            }
            Norm::Auto(_) if x.ndim() >= 2 => ops::spectral_norm(ops::to_matrix(x)?.view()),
            Norm::Sign(opts) => opts.norm(x),
            Norm::Auto(_) | Norm::BiasRms => ops::rms(x),
            Norm::L2 => ops::frobenius_norm(x),
            Norm::ColNorm(opts) => opts.norm(x, false)?,
            Norm::RowNorm(opts) => opts.norm(x, true)?,
        };
        Ok(value)
    }

    /// Draws a point on (or, for zero initializers, inside) the unit ball.
    pub fn random_unit_point<R: Rng + ?Sized>(
        &self,
        shape: &[usize],
        rng: &mut R,
    ) -> Result<ArrayD<TensorData>> {
        self.check_shape(shape)?;
        let point = match self {
            Norm::Spectral(_) | Norm::SpectralConv(_) => spectral::orthogonal_init(shape, rng)?,
            Norm::Auto(_) if shape.len() >= 2 => spectral::orthogonal_init(shape, rng)?,
            Norm::Sign(opts) => opts.random_unit_point(shape, rng),
            Norm::Auto(_) | Norm::BiasRms => ArrayD::zeros(IxDyn(shape)),
            Norm::L2 => elementwise::unit_gaussian(shape, rng),
            Norm::ColNorm(opts) => opts.random_unit_point(shape, rng, false)?,
            Norm::RowNorm(opts) => opts.random_unit_point(shape, rng, true)?,
        };
        Ok(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn kwargs(pairs: &[(&str, KwargValue)]) -> NormKwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn gaussian(shape: &[usize], seed: u64) -> ArrayD<TensorData> {
        let mut rng = StdRng::seed_from_u64(seed);
        ArrayD::random_using(IxDyn(shape), StandardNormal, &mut rng)
    }

    #[test]
    fn unknown_kind_is_a_configuration_error() {
        let err = Norm::parse("Foo", &NormKwargs::new()).unwrap_err();
        assert!(matches!(err, ScionError::Configuration(ref msg) if msg.contains("Foo")));
    }

    #[test]
    fn every_kind_round_trips_through_its_tag() {
        for kind in NormKind::ALL {
            assert_eq!(kind.as_str().parse::<NormKind>().unwrap(), kind);
            assert_eq!(Norm::from_kwargs(kind, &NormKwargs::new()).unwrap().kind(), kind);
        }
    }

    #[test]
    fn kwargs_are_validated() {
        let parsed = Norm::parse("Spectral", &kwargs(&[("max", true.into())])).unwrap();
        assert!(matches!(parsed, Norm::Spectral(SpectralOptions { max: true, .. })));

        let unknown = Norm::parse("Sign", &kwargs(&[("steps", 3.into())]));
        assert!(matches!(unknown, Err(ScionError::Configuration(_))));

        let wrong_type = Norm::parse("Sign", &kwargs(&[("normalized", "yes".into())]));
        assert!(matches!(wrong_type, Err(ScionError::Configuration(_))));

        let bad_backend = Norm::parse("Spectral", &kwargs(&[("backend", "svd".into())]));
        assert!(matches!(bad_backend, Err(ScionError::Configuration(_))));

        let zero_steps = Norm::parse("SpectralConv", &kwargs(&[("steps", 0.into())]));
        assert!(matches!(zero_steps, Err(ScionError::Configuration(_))));

        let no_kwargs = Norm::parse("BiasRMS", &kwargs(&[("normalized", true.into())]));
        assert!(matches!(no_kwargs, Err(ScionError::Configuration(_))));
    }

    #[test]
    fn shape_errors() {
        let spectral = Norm::Spectral(SpectralOptions::default());
        assert!(matches!(
            spectral.direction(&gaussian(&[3, 4, 5], 0)),
            Err(ScionError::Shape { norm: NormKind::Spectral, .. })
        ));
        assert!(spectral.check_shape(&[8]).is_err());
        assert!(spectral.check_shape(&[0, 3]).is_err());

        let conv = Norm::SpectralConv(SpectralConvOptions::default());
        assert!(conv.check_shape(&[4, 4]).is_err());

        let sign = Norm::Sign(SignOptions::default());
        let scalar = ArrayD::from_elem(IxDyn(&[]), 2.0);
        assert!(matches!(sign.direction(&scalar), Err(ScionError::Shape { .. })));

        let plain_sign = Norm::Sign(SignOptions {
            normalized: false,
            ..SignOptions::default()
        });
        assert_eq!(plain_sign.direction(&scalar).unwrap().sum(), 1.0);
    }

    #[test]
    fn directions_have_unit_policy_norm() {
        let exact_spectral = SpectralOptions::default();
        let cases: Vec<(Norm, Vec<usize>)> = vec![
            (Norm::Spectral(exact_spectral), vec![5, 8]),
            (Norm::Spectral(exact_spectral), vec![12, 3]),
            (
                Norm::Spectral(SpectralOptions {
                    max: true,
                    ..exact_spectral
                }),
                vec![6, 6],
            ),
            (Norm::SpectralConv(SpectralConvOptions::default()), vec![4, 3, 3, 3]),
            (Norm::Sign(SignOptions::default()), vec![7, 3]),
            (
                Norm::Sign(SignOptions {
                    normalized: false,
                    ..SignOptions::default()
                }),
                vec![10],
            ),
            (Norm::Auto(exact_spectral), vec![6, 2, 2]),
            (Norm::Auto(exact_spectral), vec![9]),
            (Norm::BiasRms, vec![16]),
            (Norm::L2, vec![3, 3]),
            (Norm::ColNorm(AxisNormOptions::default()), vec![5, 4]),
            (
                Norm::ColNorm(AxisNormOptions {
                    normalized: true,
                    transpose: true,
                }),
                vec![5, 4],
            ),
            (
                Norm::RowNorm(AxisNormOptions {
                    normalized: true,
                    transpose: false,
                }),
                vec![5, 4],
            ),
        ];
        for (i, (norm, shape)) in cases.iter().enumerate() {
            let g = gaussian(shape, i as u64 + 100);
            let d = norm.direction(&g).unwrap();
            assert_eq!(d.shape(), g.shape());
            let n = norm.norm(&d).unwrap();
            assert!((n - 1.0).abs() < 1e-3, "{:?} on {shape:?}: norm {n}", norm.kind());
        }
    }

    #[test]
    fn max_direction_has_unit_spectral_norm_when_heaviest_row_misleads() {
        let norm = Norm::parse("Spectral", &kwargs(&[("max", true.into())])).unwrap();
        let g = ArrayD::from_shape_vec(IxDyn(&[3, 2]), vec![1.3, 0.0, 0.0, 1.0, 0.0, 1.0]).unwrap();
        let d = ops::to_matrix(&norm.direction(&g).unwrap()).unwrap();

        // top eigenvalue of the 2x2 dᵀd, computed in closed form
        let gram = d.t().dot(&d);
        let (a, b, c) = (gram[[0, 0]], gram[[0, 1]], gram[[1, 1]]);
        let top = (a + c) / 2.0 + (((a - c) / 2.0).powi(2) + b * b).sqrt();
        assert!((top.sqrt() - 1.0).abs() < 1e-4, "true spectral norm {}", top.sqrt());
        assert!((norm.norm(&g).unwrap() - 2f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn degenerate_gradient_gives_zero_direction() {
        for kind in NormKind::ALL {
            let norm = Norm::from_kwargs(kind, &NormKwargs::new()).unwrap();
            let shape: &[usize] = match kind {
                NormKind::SpectralConv => &[2, 2, 1, 1],
                _ => &[3, 2],
            };
            let d = norm.direction(&ArrayD::zeros(IxDyn(shape))).unwrap();
            assert!(d.iter().all(|&x| x == 0.0), "{kind} produced {d:?}");
        }
    }

    #[test]
    fn normalized_sign_scales_with_inverse_sqrt_of_size() {
        let sign = Norm::Sign(SignOptions::default());
        for (i, n) in [16usize, 256, 4096].into_iter().enumerate() {
            let g = gaussian(&[n], 7 + i as u64);
            let d = sign.direction(&g).unwrap();
            let expected = 1.0 / (n as TensorData).sqrt();
            for &x in d.iter() {
                assert!((x.abs() - expected).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn identity_direction_is_identity() {
        let eye = Array2::<TensorData>::eye(4).into_dyn();
        let d = Norm::Spectral(SpectralOptions::default()).direction(&eye).unwrap();
        for (a, b) in d.iter().zip(eye.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn auto_dispatches_on_rank() {
        let auto = Norm::default();
        let v = arr1(&[3.0, -4.0, 0.0]).into_dyn();
        let d = auto.direction(&v).unwrap();
        let rms = (25.0f32 / 3.0).sqrt();
        assert!((d[[0]] - 3.0 / rms).abs() < 1e-6);
        assert_eq!(auto.radius(2.0, &[3]).unwrap(), 2.0);

        // conv-shaped tensors are flattened to [out, in*kh*kw]
        assert!((auto.radius(1.0, &[4, 1, 2, 2]).unwrap() - 1.0).abs() < 1e-6);
        assert!((auto.radius(1.0, &[16, 4]).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn radius_factors() {
        let spectral = Norm::Spectral(SpectralOptions::default());
        assert!((spectral.radius(3.0, &[64, 16]).unwrap() - 6.0).abs() < 1e-5);
        let unnormalized = Norm::Spectral(SpectralOptions {
            normalized: false,
            ..SpectralOptions::default()
        });
        assert!((unnormalized.radius(1.0, &[64, 16]).unwrap() - 8.0).abs() < 1e-5);
        let conv = Norm::SpectralConv(SpectralConvOptions::default());
        assert!((conv.radius(9.0, &[32, 8, 3, 3]).unwrap() - 2.0).abs() < 1e-5);
        assert_eq!(Norm::Sign(SignOptions::default()).radius(5.0, &[3, 3]).unwrap(), 5.0);
    }

    #[test]
    fn random_unit_points_lie_in_the_unit_ball() {
        let mut rng = StdRng::seed_from_u64(3);
        for kind in NormKind::ALL {
            let norm = Norm::from_kwargs(kind, &NormKwargs::new()).unwrap();
            let shape: &[usize] = match kind {
                NormKind::SpectralConv => &[6, 2, 3, 3],
                _ => &[6, 4],
            };
            let p = norm.random_unit_point(shape, &mut rng).unwrap();
            assert_eq!(p.shape(), shape);
            let n = norm.norm(&p).unwrap();
            assert!(n <= 1.0 + 1e-4, "{kind}: {n}");
        }
    }
}
