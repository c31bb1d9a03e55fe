//! # trellis-nn
//!
//! Modules with hand-written forward, backward and second-order backward
//! passes, built on the strided views of `trellis-core`.
//!
//! 1. **State**: value plus lazily allocated `dx`/`ddx` accumulators
//! 2. **Module / Module2**: `fprop`, `bprop`, `bbprop` over states
//! 3. **Parameter**: one flat buffer for every learnable tensor
//! 4. **Modules**: linear, table-driven convolution, bias, tanh, stdsigmoid,
//!    abs, power, threshold, softmax, diff, mul, feature sum, padding,
//!    subsampling, lp pooling, subtractive and divisive normalisation
//! 5. **Layers**: composite layers and module chains
//! 6. **ModuleTester**: finite-difference Jacobian checks
//!
//! `bbprop` computes the diagonal Gauss-Newton approximation of the second
//! derivative, not the exact Hessian diagonal.

pub mod activation;
pub mod bias;
pub mod conv;
pub mod elementwise;
pub mod forget;
pub mod layers;
pub mod linear;
pub mod module;
pub mod normalization;
pub mod pad;
pub mod parameter;
pub mod pooling;
pub mod sequential;
pub mod softmax;
pub mod state;
pub mod table;
pub mod tester;

pub use trellis_core::Element;

pub use activation::{AbsModule, PowerModule, StdsigmoidModule, TanhModule, ThresModule};
pub use bias::BiasModule;
pub use conv::ConvolutionModule;
pub use elementwise::{DiffModule, FsumModule, MulModule};
pub use forget::ForgetParam;
pub use layers::{ConvolutionLayer, FullLayer, Layer};
pub use linear::LinearModule;
pub use module::{Module, Module2};
pub use normalization::{gaussian_kernel, DivisiveNormModule, NormConfig, SubtractiveNormModule};
pub use pad::{CutborderModule, MirrorpadModule, ZpadModule};
pub use parameter::Parameter;
pub use pooling::{LppoolingModule, SubsamplingModule};
pub use sequential::Layers;
pub use softmax::SoftmaxModule;
pub use state::State;
pub use table::ConnectionTable;
pub use tester::{JacobianReport, ModuleTester};
