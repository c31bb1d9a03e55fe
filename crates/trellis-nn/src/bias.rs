// BiasModule: one learned scalar per feature, added across the remaining axes
//
// out[f, ...] = in[f, ...] + b[f]
//
// The backward pass is the identity on the input path; the bias gradient is
// the sum of the output gradient over each feature map. Layers that keep a
// single buffer for input and output use the `*_inplace` entry points.

use trellis_core::{ops, Error, Result, Tensor};

use crate::forget::ForgetParam;
use crate::module::{expect_weights, load_partial, resize_output, Module};
use crate::parameter::Parameter;
use crate::state::State;
use crate::Element;

pub struct BiasModule<T: Element> {
    name: String,
    bias: State<T>,
}

impl<T: Element> BiasModule<T> {
    pub fn new(name: impl Into<String>, features: usize, param: Option<&mut Parameter<T>>) -> Result<Self> {
        let bias = match param {
            Some(p) => State::with_parameter(features, p)?,
            None => State::with_derivatives(features)?,
        };
        Ok(BiasModule {
            name: name.into(),
            bias,
        })
    }

    pub fn bias(&self) -> &State<T> {
        &self.bias
    }

    pub fn features(&self) -> usize {
        self.bias.dims()[0]
    }

    fn check_input(&self, x: &Tensor<T>) -> Result<()> {
        if x.rank() == 0 || x.dims()[0] != self.features() {
            return Err(Error::ShapeMismatch {
                expected: x.shape().with_dim(0, self.features()).unwrap_or_else(|_| self.bias.shape().clone()),
                got: x.shape().clone(),
            });
        }
        Ok(())
    }

    fn add_bias(&self, src: &Tensor<T>, dst: &Tensor<T>) -> Result<()> {
        for (f, (s, d)) in src.bloop()?.zip(dst.bloop()?).enumerate() {
            let b = self.bias.x().get(&[f])?;
            ops::addc(&s, b, &d)?;
        }
        Ok(())
    }

    /// Sum each feature map of `grad` into the matching entry of `acc`.
    fn sum_features(grad: &Tensor<T>, acc: &Tensor<T>) -> Result<()> {
        for (g, a) in grad.bloop()?.zip(acc.bloop()?) {
            ops::sum_acc(&g, &a)?;
        }
        Ok(())
    }

    /// Add the bias to `state.x` in place.
    pub fn fprop_inplace(&mut self, state: &State<T>) -> Result<()> {
        self.check_input(state.x())?;
        self.add_bias(state.x(), state.x())
    }

    /// Accumulate the bias gradient from `state.dx`; the input gradient is
    /// `state.dx` itself and is left untouched.
    pub fn bprop_inplace(&mut self, state: &State<T>) -> Result<()> {
        Self::sum_features(state.dx()?, self.bias.dx()?)
    }

    pub fn bbprop_inplace(&mut self, state: &State<T>) -> Result<()> {
        Self::sum_features(state.ddx()?, self.bias.ddx()?)
    }
}

impl<T: Element> Module<T> for BiasModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input.x())?;
        resize_output(&self.name, output, input.shape().clone())?;
        self.add_bias(input.x(), output.x())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        let g = output.dx()?;
        Self::sum_features(g, self.bias.dx()?)?;
        ops::add_acc(g, input.dx()?)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        let g = output.ddx()?;
        Self::sum_features(g, self.bias.ddx()?)?;
        ops::add_acc(g, input.ddx()?)
    }

    fn forget(&mut self, _fp: &mut ForgetParam) -> Result<()> {
        ops::clear(self.bias.x())
    }

    fn describe(&self) -> String {
        format!("bias module {} with {} biases", self.name, self.features())
    }

    fn parameters(&self) -> Vec<&State<T>> {
        vec![&self.bias]
    }

    fn load_x(&mut self, weights: &[Tensor<T>]) -> Result<()> {
        expect_weights(&self.name, weights, 1)?;
        load_partial(&self.name, &weights[0], self.bias.x())
    }
}
