use std::fmt;

use num_traits::Float;

// DType: element types a tensor view can hold
//
// Modules compute derivatives and tanh/pow curves, so only floating-point
// element types are supported. f32 is the workhorse; f64 is what the
// finite-difference Jacobian checks run on.

/// Runtime tag for the element type, used in `describe()` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{s}")
    }
}

/// Trait bound for types that can live in a storage buffer.
///
/// `Float` supplies the arithmetic (`tanh`, `powf`, `abs`, ...); the constants
/// here are per-precision tuning knobs for numeric differentiation.
pub trait Element:
    Float + Default + Send + Sync + fmt::Debug + fmt::Display + 'static
{
    /// The DType tag for this Rust type.
    const DTYPE: DType;

    /// Perturbation used by centred finite differences.
    const FD_STEP: f64;

    /// Largest acceptable absolute Jacobian error.
    const JACOBIAN_TOL: f64;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
    const FD_STEP: f64 = 1e-3;
    const JACOBIAN_TOL: f64 = 1e-2;

    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
    const FD_STEP: f64 = 1e-6;
    const JACOBIAN_TOL: f64 = 1e-5;

    fn from_f64(v: f64) -> Self {
        v
    }
    fn to_f64(self) -> f64 {
        self
    }
}
