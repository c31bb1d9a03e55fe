// SoftmaxModule: normalised exponential over every element of the input
//
//   out = exp(beta * (x - max x)) / sum exp(beta * (x - max x))
//
// Subtracting the maximum keeps exp from overflowing and does not change
// the result. With g = out.dx:
//
//   in.dx  += beta * out * (g - <g, out>)
//   in.ddx += beta^2 * out^2 * ((1 - 2 out) * out.ddx + <out.ddx, out^2>)
//
// The second line is sum_j J[j][i]^2 * out.ddx[j] written out for the
// softmax Jacobian beta * out[j] * (delta_ij - out[i]).

use trellis_core::{ops, Result};

use crate::module::{resize_output, Module};
use crate::state::State;
use crate::Element;

pub struct SoftmaxModule<T: Element> {
    name: String,
    beta: T,
}

impl<T: Element> SoftmaxModule<T> {
    pub fn new(name: impl Into<String>) -> Self {
        SoftmaxModule::with_beta(name, T::one())
    }

    /// `beta` sharpens (> 1) or flattens (< 1) the distribution.
    pub fn with_beta(name: impl Into<String>, beta: T) -> Self {
        SoftmaxModule {
            name: name.into(),
            beta,
        }
    }

    pub fn beta(&self) -> T {
        self.beta
    }
}

impl<T: Element> Module<T> for SoftmaxModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        resize_output(&self.name, output, input.shape().clone())?;
        let top = ops::max(input.x())?;
        let beta = self.beta;
        ops::apply2(input.x(), output.x(), |x, y| *y = (beta * (x - top)).exp())?;
        let total = ops::sum(output.x())?;
        ops::dotc(output.x(), T::one() / total, output.x())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        let dot = ops::dot(output.dx()?, output.x())?;
        let beta = self.beta;
        ops::apply3(output.x(), output.dx()?, input.dx()?, |y, g, d| {
            *d = *d + beta * y * (g - dot)
        })
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        // <out.ddx, out^2>
        let spread = ops::sqr_dot(output.x(), output.ddx()?)?;
        let beta2 = self.beta * self.beta;
        let two = T::one() + T::one();
        ops::apply3(output.x(), output.ddx()?, input.ddx()?, |y, h, d| {
            *d = *d + beta2 * y * y * ((T::one() - two * y) * h + spread)
        })
    }

    fn describe(&self) -> String {
        format!("softmax module {} with beta {}", self.name, self.beta)
    }
}
