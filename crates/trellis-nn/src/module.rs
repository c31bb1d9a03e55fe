// Module traits: the three propagation entry points
//
// A module maps input State(s) to an output State with hand-written
// derivative formulas:
//
//   fprop   out.x  = f(in.x)
//   bprop   in.dx  += J^T out.dx          (and parameter dx likewise)
//   bbprop  in.ddx += (J^2)^T out.ddx     (diagonal Gauss-Newton curvature)
//
// bbprop is NOT the exact second derivative: it propagates the squared
// Jacobian and drops the terms involving second derivatives of f. This is
// the usual approximation for diagonal-Hessian learning-rate estimation.
//
// Order matters: bprop reuses what the last fprop computed, bbprop reuses
// what the last bprop saw. Nothing enforces it beyond the errors raised when
// a derivative buffer is read before allocation. Callers prepare the input
// derivatives (`State::prepare_dx`) before calling bprop.
//
// The output of fprop is resized by the module itself, only when the shape
// actually changes.

use trellis_core::{bail, ops, Error, Result, Shape, Tensor};

use crate::forget::ForgetParam;
use crate::state::State;
use crate::Element;

/// A module with one input and one output.
pub trait Module<T: Element> {
    /// Instance name used in logs and descriptions.
    fn name(&self) -> &str;

    /// Compute `output.x` from `input.x`, resizing the output as needed.
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()>;

    /// Accumulate first derivatives into `input.dx` and parameter dx.
    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()>;

    /// Accumulate the diagonal second-derivative approximation into
    /// `input.ddx` and parameter ddx.
    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()>;

    /// Reinitialise learnable parameters. Default: nothing to forget.
    fn forget(&mut self, _fp: &mut ForgetParam) -> Result<()> {
        Ok(())
    }

    /// Human-readable summary.
    fn describe(&self) -> String;

    /// Output shape produced by an input of shape `input`.
    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        Ok(input.clone())
    }

    /// Input shape needed to produce an output of shape `output`.
    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        Ok(output.clone())
    }

    /// Learnable parameters, in a stable order.
    fn parameters(&self) -> Vec<&State<T>> {
        vec![]
    }

    /// Load parameter values, one tensor per entry of `parameters()`.
    fn load_x(&mut self, weights: &[Tensor<T>]) -> Result<()> {
        if !weights.is_empty() {
            bail!("{} has no parameters to load", self.name());
        }
        Ok(())
    }

    /// Total number of learnable scalars.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.x().elem_count()).sum()
    }
}

/// A module with two inputs and one output.
pub trait Module2<T: Element> {
    fn name(&self) -> &str;

    fn fprop(&mut self, in1: &State<T>, in2: &State<T>, output: &mut State<T>) -> Result<()>;

    fn bprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()>;

    fn bbprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>)
        -> Result<()>;

    fn describe(&self) -> String;
}

/// Resize `output` to `shape` if it differs, logging the change.
pub(crate) fn resize_output<T: Element>(
    name: &str,
    output: &mut State<T>,
    shape: impl Into<Shape>,
) -> Result<bool> {
    let shape = shape.into();
    if output.shape() == &shape {
        return Ok(false);
    }
    log::debug!("{}: resizing output from {} to {}", name, output.shape(), shape);
    output.resize(shape)
}

/// Fail unless `t` has exactly `rank` dimensions.
pub(crate) fn expect_rank<T: Element>(t: &Tensor<T>, rank: usize) -> Result<()> {
    if t.rank() != rank {
        return Err(Error::RankMismatch {
            expected: rank,
            got: t.rank(),
        });
    }
    Ok(())
}

/// Copy `src` into the parameter `dst`.
///
/// When only the leading (feature) axis differs, the overlapping features
/// are copied and a warning is logged. Any other mismatch is an error.
pub(crate) fn load_partial<T: Element>(name: &str, src: &Tensor<T>, dst: &Tensor<T>) -> Result<()> {
    if src.shape() == dst.shape() {
        return ops::copy(src, dst);
    }
    let same_tail = src.rank() == dst.rank() && src.rank() > 0 && src.dims()[1..] == dst.dims()[1..];
    if !same_tail {
        return Err(Error::ShapeMismatch {
            expected: dst.shape().clone(),
            got: src.shape().clone(),
        });
    }
    let n = src.dims()[0].min(dst.dims()[0]);
    log::warn!(
        "{}: partial load of {} features from weights of shape {} into parameter of shape {}",
        name,
        n,
        src.shape(),
        dst.shape()
    );
    ops::copy(&src.narrow(0, n, 0)?, &dst.narrow(0, n, 0)?)
}

/// Expect exactly `n` weight tensors in a `load_x` call.
pub(crate) fn expect_weights<T: Element>(name: &str, weights: &[Tensor<T>], n: usize) -> Result<()> {
    if weights.len() != n {
        bail!("{} expects {} weight tensors, got {}", name, n, weights.len());
    }
    Ok(())
}
