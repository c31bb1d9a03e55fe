// Composite layers: weights -> per-feature bias -> tanh
//
//   FullLayer         linear      -> bias(nout)      -> tanh
//   ConvolutionLayer  convolution -> bias(thickness) -> tanh
//
// The weighted sum lives in an internal `sum` state. The bias is added to
// it in place, so the bias backward pass only has to collect its own
// gradient: the gradient w.r.t. the pre-bias sum is the same buffer.

use trellis_core::{Result, Shape, Tensor};

use crate::activation::TanhModule;
use crate::bias::BiasModule;
use crate::conv::ConvolutionModule;
use crate::forget::ForgetParam;
use crate::linear::LinearModule;
use crate::module::{expect_weights, Module};
use crate::parameter::Parameter;
use crate::state::State;
use crate::table::ConnectionTable;
use crate::Element;

/// A weight module followed by a bias and a tanh squashing function.
pub struct Layer<T: Element, M: Module<T>> {
    name: String,
    kind: &'static str,
    inner: M,
    adder: BiasModule<T>,
    squash: TanhModule,
    sum: State<T>,
}

/// linear -> bias -> tanh
pub type FullLayer<T> = Layer<T, LinearModule<T>>;

/// convolution -> bias -> tanh
pub type ConvolutionLayer<T> = Layer<T, ConvolutionModule<T>>;

impl<T: Element> FullLayer<T> {
    pub fn new(
        name: impl Into<String>,
        nin: usize,
        nout: usize,
        mut param: Option<&mut Parameter<T>>,
    ) -> Result<Self> {
        let name = name.into();
        let linear = LinearModule::new(format!("{}.linear", name), nin, nout, param.as_deref_mut())?;
        let adder = BiasModule::new(format!("{}.bias", name), nout, param)?;
        Layer::assemble(name, "full", linear, adder)
    }
}

impl<T: Element> ConvolutionLayer<T> {
    pub fn new(
        name: impl Into<String>,
        kernel: impl Into<Shape>,
        stride: impl Into<Shape>,
        table: ConnectionTable,
        mut param: Option<&mut Parameter<T>>,
    ) -> Result<Self> {
        let name = name.into();
        let conv = ConvolutionModule::new(
            format!("{}.convolution", name),
            kernel,
            stride,
            table,
            param.as_deref_mut(),
        )?;
        let adder = BiasModule::new(format!("{}.bias", name), conv.thickness(), param)?;
        Layer::assemble(name, "convolution", conv, adder)
    }
}

impl<T: Element, M: Module<T>> Layer<T, M> {
    fn assemble(name: String, kind: &'static str, inner: M, adder: BiasModule<T>) -> Result<Self> {
        Ok(Layer {
            squash: TanhModule::new(format!("{}.tanh", name)),
            name,
            kind,
            inner,
            adder,
            sum: State::new(1)?,
        })
    }

    /// The weight module (linear or convolution).
    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.inner
    }

    pub fn bias(&self) -> &BiasModule<T> {
        &self.adder
    }

    /// Pre-activation values from the last fprop.
    pub fn sum(&self) -> &State<T> {
        &self.sum
    }
}

impl<T: Element, M: Module<T>> Module<T> for Layer<T, M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.inner.fprop(input, &mut self.sum)?;
        self.adder.fprop_inplace(&self.sum)?;
        self.squash.fprop(&self.sum, output)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.sum.prepare_dx()?;
        self.squash.bprop(&mut self.sum, output)?;
        self.adder.bprop_inplace(&self.sum)?;
        self.inner.bprop(input, &self.sum)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.sum.prepare_ddx()?;
        self.squash.bbprop(&mut self.sum, output)?;
        self.adder.bbprop_inplace(&self.sum)?;
        self.inner.bbprop(input, &self.sum)
    }

    fn forget(&mut self, fp: &mut ForgetParam) -> Result<()> {
        self.inner.forget(fp)?;
        self.adder.forget(fp)
    }

    fn describe(&self) -> String {
        format!(
            "{} layer {} with {}, {}",
            self.kind,
            self.name,
            self.inner.describe(),
            self.adder.describe()
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        self.inner.fprop_size(input)
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        self.inner.bprop_size(output)
    }

    fn parameters(&self) -> Vec<&State<T>> {
        let mut params = self.inner.parameters();
        params.extend(self.adder.parameters());
        params
    }

    /// Weights first, then biases.
    fn load_x(&mut self, weights: &[Tensor<T>]) -> Result<()> {
        expect_weights(&self.name, weights, 2)?;
        self.inner.load_x(&weights[..1])?;
        self.adder.load_x(&weights[1..])
    }
}
