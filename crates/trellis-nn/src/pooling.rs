// SubsamplingModule: learned-scale sum pooling
//
// Input [F, rows, cols] is tiled with non-overlapping si x sj windows
// (trailing rows/cols that do not fill a window are ignored). Each window
// is summed and feature f is scaled by its own learned coefficient:
//
//   sub[f, i, j] = sum of window (i, j) of in[f]
//   out[f, i, j] = coeff[f] * sub[f, i, j]
//
// BACKWARD:
//
//   coeff.dx[f] += <sub[f], out.dx[f]>
//   in.dx[f]    += oversample(coeff[f] * out.dx[f])
//
// The second-order pass squares sub and coeff.
//
// LppoolingModule: gaussian-weighted Lp norm over each window
//
//   out[f] = (conv(|in[f]|^p, gaussian))^(1/p)
//
// built as a chain of abs (odd p only), power p, a one-to-one strided
// convolution with a fixed gaussian kernel, and power 1/p. With p = 1 the
// power modules are left out.

use trellis_core::{bail, contract, ops, Error, Result, Shape, Tensor};

use crate::activation::{AbsModule, PowerModule};
use crate::conv::ConvolutionModule;
use crate::forget::ForgetParam;
use crate::module::{expect_rank, expect_weights, load_partial, resize_output, Module};
use crate::normalization::{gaussian_kernel, DEFAULT_GAUSSIAN_COEFF};
use crate::parameter::Parameter;
use crate::sequential::Layers;
use crate::state::State;
use crate::table::ConnectionTable;
use crate::Element;

pub struct SubsamplingModule<T: Element> {
    name: String,
    coeff: State<T>,
    stride: [usize; 2],
    ones: Tensor<T>,
    /// Window sums from the last fprop.
    sub: Tensor<T>,
}

impl<T: Element> SubsamplingModule<T> {
    /// `thickness` feature maps pooled with `stride` windows. Coefficients
    /// start at 1 / sqrt(si * sj).
    pub fn new(
        name: impl Into<String>,
        thickness: usize,
        stride: impl Into<Shape>,
        param: Option<&mut Parameter<T>>,
    ) -> Result<Self> {
        let stride = stride.into();
        if stride.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: stride.rank(),
            });
        }
        let stride = [stride.dims()[0], stride.dims()[1]];
        if stride[0] == 0 || stride[1] == 0 {
            bail!("subsampling stride must be positive, got {}x{}", stride[0], stride[1]);
        }
        let coeff = match param {
            Some(p) => State::with_parameter(thickness, p)?,
            None => State::with_derivatives(thickness)?,
        };
        let module = SubsamplingModule {
            name: name.into(),
            coeff,
            stride,
            ones: Tensor::full((stride[0], stride[1]), T::one())?,
            sub: Tensor::zeros((thickness, 1, 1))?,
        };
        module.fill_coefficients(1.0, 0.5)?;
        Ok(module)
    }

    /// Set every coefficient to value / (si * sj)^exponent.
    fn fill_coefficients(&self, value: f64, exponent: f64) -> Result<()> {
        let area = (self.stride[0] * self.stride[1]) as f64;
        ops::fill(self.coeff.x(), T::from_f64(value / area.powf(exponent)))
    }

    fn output_extent(&self, shape: &Shape) -> Result<(usize, usize)> {
        let d = shape.dims();
        let [si, sj] = self.stride;
        let (oi, oj) = (d[1] / si, d[2] / sj);
        if oi == 0 || oj == 0 {
            bail!("{}: input {} is smaller than the {}x{} stride", self.name, shape, si, sj);
        }
        Ok((oi, oj))
    }

    pub fn coefficients(&self) -> &State<T> {
        &self.coeff
    }

    pub fn thickness(&self) -> usize {
        self.coeff.dims()[0]
    }

    /// Output extents and the [F, oi, oj, si, sj] windows of `t`.
    fn windows(&self, t: &Tensor<T>) -> Result<(usize, usize, Tensor<T>)> {
        expect_rank(t, 3)?;
        let d = t.dims();
        if d[0] != self.thickness() {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((self.thickness(), d[1], d[2])),
                got: t.shape().clone(),
            });
        }
        let [si, sj] = self.stride;
        let (oi, oj) = self.output_extent(t.shape())?;
        let w = t
            .narrow(1, oi * si, 0)?
            .narrow(2, oj * sj, 0)?
            .unfold(1, si, si)?
            .unfold(2, sj, sj)?;
        Ok((oi, oj, w))
    }

    fn backward(&self, grad: &Tensor<T>, acc: &Tensor<T>, coeff_acc: &Tensor<T>, second: bool) -> Result<()> {
        let (oi, oj, _) = self.windows(acc)?;
        let [si, sj] = self.stride;
        let region = acc.narrow(1, oi * si, 0)?.narrow(2, oj * sj, 0)?;
        let scaled = Tensor::zeros((oi, oj))?;
        for f in 0..self.thickness() {
            let g = grad.select(0, f)?;
            let s = self.sub.select(0, f)?;
            let c = self.coeff.x().get(&[f])?;
            let (dc, c) = if second {
                (ops::sqr_dot(&s, &g)?, c * c)
            } else {
                (ops::dot(&s, &g)?, c)
            };
            ops::apply1(&coeff_acc.select(0, f)?, |v| *v = *v + dc)?;
            ops::dotc(&g, c, &scaled)?;
            contract::m2oversampleacc(&scaled, si, sj, &region.select(0, f)?)?;
        }
        Ok(())
    }
}

impl<T: Element> Module<T> for SubsamplingModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        let (oi, oj, windows) = self.windows(input.x())?;
        let shape = Shape::from((self.thickness(), oi, oj));
        if self.sub.shape() != &shape {
            log::debug!("{}: resizing window sums to {}", self.name, shape);
            self.sub.resize(shape.clone())?;
        }
        resize_output(&self.name, output, shape)?;
        ops::clear(&self.sub)?;
        for f in 0..self.thickness() {
            let s = self.sub.select(0, f)?;
            contract::m4dotm2acc(&windows.select(0, f)?, &self.ones, &s)?;
            ops::dotc(&s, self.coeff.x().get(&[f])?, &output.x().select(0, f)?)?;
        }
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.backward(output.dx()?, input.dx()?, self.coeff.dx()?, false)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.backward(output.ddx()?, input.ddx()?, self.coeff.ddx()?, true)
    }

    fn forget(&mut self, fp: &mut ForgetParam) -> Result<()> {
        self.fill_coefficients(fp.value, fp.exponent)
    }

    fn describe(&self) -> String {
        format!(
            "subsampling module {} with thickness {} and stride {}x{}",
            self.name,
            self.thickness(),
            self.stride[0],
            self.stride[1]
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        if input.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: input.rank(),
            });
        }
        let (oi, oj) = self.output_extent(input)?;
        Ok(Shape::from((self.thickness(), oi, oj)))
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        if output.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: output.rank(),
            });
        }
        let d = output.dims();
        Ok(Shape::from((
            self.thickness(),
            d[1] * self.stride[0],
            d[2] * self.stride[1],
        )))
    }

    fn parameters(&self) -> Vec<&State<T>> {
        vec![&self.coeff]
    }

    fn load_x(&mut self, weights: &[Tensor<T>]) -> Result<()> {
        expect_weights(&self.name, weights, 1)?;
        load_partial(&self.name, &weights[0], self.coeff.x())
    }
}

pub struct LppoolingModule<T: Element> {
    name: String,
    thickness: usize,
    kernel: [usize; 2],
    stride: [usize; 2],
    power: u32,
    chain: Layers<T>,
}

impl<T: Element> LppoolingModule<T> {
    /// Pool `thickness` feature maps over `kernel` windows every `stride`
    /// pixels with the L`power` norm.
    pub fn new(
        name: impl Into<String>,
        thickness: usize,
        kernel: impl Into<Shape>,
        stride: impl Into<Shape>,
        power: u32,
    ) -> Result<Self> {
        let name = name.into();
        if power == 0 {
            bail!("{}: lp pooling power must be at least 1", name);
        }
        let mut conv = ConvolutionModule::new(
            format!("{}_conv", name),
            kernel,
            stride,
            ConnectionTable::one_to_one(thickness),
            None,
        )?;
        let kernel = conv.kernel_size();
        let g = gaussian_kernel::<T>(kernel[0], kernel[1], DEFAULT_GAUSSIAN_COEFF)?;
        let kernels = Tensor::zeros((thickness, kernel[0], kernel[1]))?;
        for k in kernels.bloop()? {
            ops::copy(&g, &k)?;
        }
        conv.load_x(&[kernels])?;
        let stride = conv.stride();

        let mut chain = Layers::new(format!("{}_chain", name));
        if power % 2 == 1 {
            chain.push(Box::new(AbsModule::new(format!("{}_abs", name), T::zero())));
        }
        if power > 1 {
            let p = T::from_f64(power as f64);
            chain.push(Box::new(PowerModule::new(format!("{}_pow", name), p)));
        }
        chain.push(Box::new(conv));
        if power > 1 {
            let root = T::one() / T::from_f64(power as f64);
            chain.push(Box::new(PowerModule::new(format!("{}_root", name), root)));
        }
        Ok(LppoolingModule {
            name,
            thickness,
            kernel,
            stride,
            power,
            chain,
        })
    }

    pub fn power(&self) -> u32 {
        self.power
    }

    fn clear_kernel(&self, second: bool) -> Result<()> {
        for p in self.chain.parameters() {
            if second {
                p.zero_ddx()?;
            } else {
                p.zero_dx()?;
            }
        }
        Ok(())
    }
}

impl<T: Element> Module<T> for LppoolingModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        expect_rank(input.x(), 3)?;
        if input.dims()[0] != self.thickness {
            return Err(Error::ShapeMismatch {
                expected: input.shape().with_dim(0, self.thickness)?,
                got: input.shape().clone(),
            });
        }
        self.chain.fprop(input, output)
    }

    // the gaussian kernel is fixed: its derivatives are cleared, never read
    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.clear_kernel(false)?;
        self.chain.bprop(input, output)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.clear_kernel(true)?;
        self.chain.bbprop(input, output)
    }

    fn describe(&self) -> String {
        format!(
            "lppooling module {} with thickness {}, kernel {}x{}, stride {}x{} and power {}",
            self.name,
            self.thickness,
            self.kernel[0],
            self.kernel[1],
            self.stride[0],
            self.stride[1],
            self.power
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        self.chain.fprop_size(input)
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        self.chain.bprop_size(output)
    }
}
