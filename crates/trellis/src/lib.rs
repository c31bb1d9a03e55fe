//! # Trellis
//!
//! A convolutional network library built on strided tensor views, with
//! hand-written first- and second-order backward passes.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use trellis::prelude::*;
//!
//! # fn main() -> trellis::Result<()> {
//! let mut linear = LinearModule::<f64>::new("l", 3, 2, None)?;
//! let input = State::from_tensor(Tensor::from_vec(vec![1.0, 2.0, 3.0], 3)?);
//! let mut output = State::new(2)?;
//! linear.fprop(&input, &mut output)?;
//! assert_eq!(output.dims(), &[2]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `trellis-core` | Storage, Shape, Layout, Tensor views, iteration, ops, contractions |
//! | `trellis-nn` | State, Parameter, Module traits, modules, layers, Jacobian tester |

/// Re-export core types.
pub use trellis_core::{
    contract, iter, ops, DType, Element, Error, Layout, Looper, Result, Shape, Storage, Tensor,
    MAX_RANK,
};

/// Re-export the modules.
pub mod nn {
    pub use trellis_nn::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::nn::{
        AbsModule, BiasModule, ConnectionTable, ConvolutionLayer, ConvolutionModule,
        CutborderModule, DiffModule, DivisiveNormModule, ForgetParam, FsumModule, FullLayer,
        JacobianReport, Layers, LinearModule, LppoolingModule, MirrorpadModule, Module, Module2,
        ModuleTester, MulModule, NormConfig, Parameter, PowerModule, SoftmaxModule, State,
        StdsigmoidModule, SubsamplingModule, SubtractiveNormModule, TanhModule, ThresModule,
        ZpadModule,
    };
    pub use crate::{ops, DType, Element, Shape, Tensor};
}
