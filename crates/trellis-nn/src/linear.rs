// LinearModule: out = W · in
//
// The input's leading axis holds the `nin` features; every trailing axis is
// treated as independent samples. Internally the input is viewed as a
// [nin, P] matrix (P = product of the trailing extents), multiplied by the
// [nout, nin] weight, and the [nout, P] result is viewed back with the
// leading axis replaced by `nout`. The matrix views need contiguous input
// and output.
//
// BACKWARD:
//
//   W.dx   += out.dx · in.x^T
//   in.dx  += W^T · out.dx
//
// CURVATURE (diagonal Gauss-Newton):
//
//   W.ddx  += out.ddx · (in.x^2)^T
//   in.ddx += (W^2)^T · out.ddx
//
// INITIALISATION: U(-z, z) with z = value / nin^exponent.

use trellis_core::{contract, ops, Error, Result, Shape, Tensor};

use crate::forget::ForgetParam;
use crate::module::{expect_weights, load_partial, resize_output, Module};
use crate::parameter::Parameter;
use crate::state::State;
use crate::Element;

/// Fully connected layer without bias.
pub struct LinearModule<T: Element> {
    name: String,
    w: State<T>,
}

impl<T: Element> LinearModule<T> {
    /// Create a `nout x nin` weight. With `param`, the weight is carved out
    /// of the shared buffer; otherwise the module owns private storage.
    pub fn new(
        name: impl Into<String>,
        nin: usize,
        nout: usize,
        param: Option<&mut Parameter<T>>,
    ) -> Result<Self> {
        let shape = Shape::from((nout, nin));
        let w = match param {
            Some(p) => State::with_parameter(shape, p)?,
            None => State::with_derivatives(shape)?,
        };
        Ok(LinearModule {
            name: name.into(),
            w,
        })
    }

    pub fn weight(&self) -> &State<T> {
        &self.w
    }

    pub fn in_features(&self) -> usize {
        self.w.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.w.dims()[0]
    }

    /// [nin, P] (or [nout, P]) matrix view of a contiguous state tensor.
    fn as_matrix(t: &Tensor<T>) -> Result<Tensor<T>> {
        if t.rank() == 0 {
            return Err(Error::DimOutOfRange { dim: 0, rank: 0 });
        }
        let rows = t.dims()[0];
        let cols = t.dims()[1..].iter().product::<usize>();
        t.reshape((rows, cols))
    }

    fn check_input(&self, input: &Tensor<T>) -> Result<()> {
        if input.rank() == 0 || input.dims()[0] != self.in_features() {
            let expected = input
                .shape()
                .with_dim(0, self.in_features())
                .unwrap_or_else(|_| Shape::from(self.in_features()));
            return Err(Error::ShapeMismatch {
                expected,
                got: input.shape().clone(),
            });
        }
        Ok(())
    }
}

impl<T: Element> Module<T> for LinearModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input.x())?;
        let shape = self.fprop_size(input.shape())?;
        resize_output(&self.name, output, shape)?;
        let inx = Self::as_matrix(input.x())?;
        let outx = Self::as_matrix(output.x())?;
        ops::clear(&outx)?;
        contract::m2dotm2acc(self.w.x(), &inx, &outx)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        let inx = Self::as_matrix(input.x())?;
        let indx = Self::as_matrix(input.dx()?)?;
        let outdx = Self::as_matrix(output.dx()?)?;
        contract::m2dotm2acc(&outdx, &inx.transpose(0, 1)?, self.w.dx()?)?;
        contract::m2dotm2acc(&self.w.x().transpose(0, 1)?, &outdx, &indx)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        let inx = Self::as_matrix(input.x())?;
        let inddx = Self::as_matrix(input.ddx()?)?;
        let outddx = Self::as_matrix(output.ddx()?)?;
        // W.ddx^T[nin, nout] += in.x^2 · out.ddx^T
        contract::m2squdotm2acc(
            &inx,
            &outddx.transpose(0, 1)?,
            &self.w.ddx()?.transpose(0, 1)?,
        )?;
        contract::m2squdotm2acc(&self.w.x().transpose(0, 1)?, &outddx, &inddx)
    }

    fn forget(&mut self, fp: &mut ForgetParam) -> Result<()> {
        fp.fill_uniform(self.w.x(), self.in_features())
    }

    fn describe(&self) -> String {
        format!(
            "linear module {} {} -> {}",
            self.name,
            self.in_features(),
            self.out_features()
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        input.with_dim(0, self.out_features())
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        output.with_dim(0, self.in_features())
    }

    fn parameters(&self) -> Vec<&State<T>> {
        vec![&self.w]
    }

    fn load_x(&mut self, weights: &[Tensor<T>]) -> Result<()> {
        expect_weights(&self.name, weights, 1)?;
        load_partial(&self.name, &weights[0], self.w.x())
    }
}
