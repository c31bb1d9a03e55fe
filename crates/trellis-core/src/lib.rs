//! # trellis-core
//!
//! Strided tensor views over shared storage, and the iteration engine that
//! walks them.
//!
//! This crate provides:
//! - [`Storage`]: reference-counted, growable element buffer
//! - [`Shape`] / [`Layout`]: extents, strides and offset of a view
//! - [`Tensor`]: a view, with zero-copy select/narrow/transpose/unfold
//! - [`iter`]: contiguous and strided visitors, loopers
//! - [`ops`] / [`contract`]: elementwise operators, reductions, contractions
//! - [`Element`] / [`DType`]: the element types (f32, f64)

pub mod contract;
pub mod dtype;
pub mod error;
pub mod iter;
pub mod layout;
pub mod ops;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use dtype::{DType, Element};
pub use error::{Error, Result};
pub use iter::Looper;
pub use layout::Layout;
pub use shape::{Shape, MAX_RANK};
pub use storage::Storage;
pub use tensor::Tensor;
