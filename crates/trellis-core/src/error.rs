use crate::shape::Shape;

/// All errors that can occur within trellis.
///
/// Every fatal condition (bad shapes, bad indices, bad connection tables,
/// derivative buffers read before allocation) surfaces as one of these.
/// Advisory conditions are logged instead and never become an `Error`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two operands were required to have the same shape.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Views are limited to `MAX_RANK` dimensions.
    #[error("rank {rank} exceeds the maximum supported rank {max}")]
    RankTooLarge { rank: usize, max: usize },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Element index out of range along one axis.
    #[error("index out of range: index {index} on dim {dim} of size {size}")]
    IndexOutOfRange { dim: usize, index: usize, size: usize },

    /// Narrow operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Sliding windows do not tile the axis exactly.
    #[error("cannot unfold dim {dim} of size {dim_size} with window {window} and step {step}")]
    UnfoldOutOfBounds {
        dim: usize,
        dim_size: usize,
        window: usize,
        step: usize,
    },

    /// Operands must hold the same number of elements.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Operation only works on row-major views.
    #[error("{op} requires a contiguous view, got shape {shape} with strides {strides:?}")]
    NotContiguous {
        op: &'static str,
        shape: Shape,
        strides: Vec<usize>,
    },

    /// A derivative buffer was read before `resize_dx`/`resize_ddx`.
    #[error("{which} buffer accessed before allocation")]
    DerivativeNotAllocated { which: &'static str },

    /// The value was resized after the derivative buffer was allocated.
    #[error("{which} buffer has shape {got} but the value has shape {expected}")]
    StaleDerivative {
        which: &'static str,
        expected: Shape,
        got: Shape,
    },

    /// Connection table is malformed or connects nothing.
    #[error("invalid connection table: {0}")]
    InvalidTable(String),

    /// A thread panicked while holding a storage lock.
    #[error("storage lock poisoned")]
    StoragePoisoned,

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout trellis.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("kernel {} larger than input {}", k, n)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
