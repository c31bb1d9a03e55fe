// Local contrast normalisation
//
// Both modules weight a neighbourhood of every pixel with a fixed gaussian
// kernel, computed by a padded one-to-one convolution so the output keeps
// the input's [features, rows, cols] shape:
//
//   weighting(x) = fsum(conv(pad(x), gaussian))     (fsum only across features)
//
// SubtractiveNormModule:  out = in - weighting(in)
// DivisiveNormModule:     out = in / max(sqrt(weighting(in^2) + eps), t)
//
// where t is 1, or the mean of the local standard deviations when the
// adaptive threshold is on. Both are composed from existing modules and
// their backward passes run the members in reverse. The adaptive threshold
// is treated as a constant by bprop.
//
// Across features, the kernels are rescaled so all of them together sum to
// one, and the fsum spreads the total back to every feature.

use trellis_core::{bail, ops, Error, Result, Shape, Tensor};

use crate::activation::{PowerModule, ThresModule};
use crate::conv::ConvolutionModule;
use crate::elementwise::{DiffModule, FsumModule, MulModule};
use crate::module::{expect_rank, Module, Module2};
use crate::pad::{MirrorpadModule, ZpadModule};
use crate::sequential::Layers;
use crate::state::State;
use crate::table::ConnectionTable;
use crate::Element;

/// Default width coefficient of the weighting kernel.
pub const DEFAULT_GAUSSIAN_COEFF: f64 = 2.0;

/// Default bias added to the local variance.
pub const NORM_EPSILON: f64 = 1e-6;

/// `rows x cols` gaussian kernel normalised to sum to one.
///
/// The spread follows the smaller side n: with s = n / 4 the exponent is
/// -(di^2 + dj^2) / (coeff * s), or / s^2 when `coeff` is 0. Offsets are
/// taken from (n / 2, n / 2).
pub fn gaussian_kernel<T: Element>(rows: usize, cols: usize, coeff: f64) -> Result<Tensor<T>> {
    if rows == 0 || cols == 0 {
        bail!("gaussian kernel must be at least 1x1, got {}x{}", rows, cols);
    }
    let n = rows.min(cols);
    let s = n as f64 / 4.0;
    let vinv = if coeff == 0.0 { 1.0 / (s * s) } else { 1.0 / (coeff * s) };
    let c = (n / 2) as f64;
    let mut values = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            let (di, dj) = (i as f64 - c, j as f64 - c);
            values.push((-vinv * (di * di + dj * dj)).exp());
        }
    }
    let total: f64 = values.iter().sum();
    Tensor::from_vec(
        values.into_iter().map(|v| T::from_f64(v / total)).collect(),
        (rows, cols),
    )
}

/// Construction options shared by both normalisers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// [rows, cols] of the weighting kernel.
    pub kernel: [usize; 2],
    /// Number of input feature maps.
    pub features: usize,
    /// Mirror padding instead of zero padding (needs an odd kernel).
    pub mirror: bool,
    /// Weight across features as well as spatially.
    pub across_features: bool,
    /// Gaussian width coefficient.
    pub gaussian_coeff: f64,
    /// Divide the feature sum by the group size.
    pub fsum_div: bool,
    /// Fraction of the features in one feature-sum group.
    pub fsum_split: f64,
}

impl NormConfig {
    pub fn new(kernel: impl Into<Shape>, features: usize) -> Result<Self> {
        let kernel = kernel.into();
        if kernel.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: kernel.rank(),
            });
        }
        Ok(NormConfig {
            kernel: [kernel.dims()[0], kernel.dims()[1]],
            features,
            mirror: false,
            across_features: true,
            gaussian_coeff: DEFAULT_GAUSSIAN_COEFF,
            fsum_div: false,
            fsum_split: 1.0,
        })
    }

    pub fn mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn across_features(mut self, across: bool) -> Self {
        self.across_features = across;
        self
    }

    pub fn gaussian_coeff(mut self, coeff: f64) -> Self {
        self.gaussian_coeff = coeff;
        self
    }

    pub fn fsum(mut self, div: bool, split: f64) -> Self {
        self.fsum_div = div;
        self.fsum_split = split;
        self
    }

    fn describe(&self) -> String {
        format!(
            "kernel {}x{}, using {} padding, {}across features",
            self.kernel[0],
            self.kernel[1],
            if self.mirror { "mirror" } else { "zero" },
            if self.across_features { "" } else { "not " }
        )
    }

    /// Padding, gaussian convolution and, across features, the feature sum.
    fn weighting<T: Element>(&self, name: &str) -> Result<Layers<T>> {
        let [ki, kj] = self.kernel;
        if self.features == 0 {
            bail!("{}: normalisation needs at least one feature", name);
        }
        let mut chain = Layers::new(format!("{}_weighting", name));
        if self.mirror {
            if ki % 2 == 0 || kj % 2 == 0 {
                bail!("{}: mirror padding needs an odd kernel, got {}x{}", name, ki, kj);
            }
            chain.push(Box::new(MirrorpadModule::new(
                format!("{}_pad", name),
                (ki - 1) / 2,
                (kj - 1) / 2,
            )));
        } else {
            chain.push(Box::new(ZpadModule::from_kernel(format!("{}_pad", name), (ki, kj))?));
        }

        let mut conv = ConvolutionModule::new(
            format!("{}_conv", name),
            (ki, kj),
            (1, 1),
            ConnectionTable::one_to_one(self.features),
            None,
        )?;
        let g = gaussian_kernel::<T>(ki, kj, self.gaussian_coeff)?;
        let kernels = Tensor::zeros((self.features, ki, kj))?;
        for k in kernels.bloop()? {
            ops::copy(&g, &k)?;
        }
        if self.across_features {
            let total = ops::sum(&kernels)?;
            ops::dotc(&kernels, T::one() / total, &kernels)?;
        }
        conv.load_x(&[kernels])?;
        chain.push(Box::new(conv));

        if self.across_features {
            chain.push(Box::new(FsumModule::new(
                format!("{}_fsum", name),
                self.fsum_div,
                self.fsum_split,
            )));
        }
        Ok(chain)
    }

    fn check_input<T: Element>(&self, name: &str, x: &Tensor<T>) -> Result<()> {
        expect_rank(x, 3)?;
        if x.dims()[0] != self.features {
            bail!(
                "{}: expected {} feature maps, got input {}",
                name,
                self.features,
                x.shape()
            );
        }
        Ok(())
    }
}

/// Clear the derivatives of the fixed weighting kernels.
fn clear_weighting<T: Element>(chain: &Layers<T>, second: bool) -> Result<()> {
    for p in chain.parameters() {
        if second {
            p.zero_ddx()?;
        } else {
            p.zero_dx()?;
        }
    }
    Ok(())
}

/// Removes the gaussian-weighted local mean.
pub struct SubtractiveNormModule<T: Element> {
    name: String,
    config: NormConfig,
    weighting: Layers<T>,
    diff: DiffModule,
    mean: State<T>,
}

impl<T: Element> SubtractiveNormModule<T> {
    pub fn new(name: impl Into<String>, config: NormConfig) -> Result<Self> {
        let name = name.into();
        let weighting = config.weighting(&name)?;
        Ok(SubtractiveNormModule {
            diff: DiffModule::new(format!("{}_diff", name)),
            mean: State::new(1)?,
            name,
            config,
            weighting,
        })
    }

    /// Local mean from the last fprop.
    pub fn mean(&self) -> &State<T> {
        &self.mean
    }
}

impl<T: Element> Module<T> for SubtractiveNormModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.config.check_input(&self.name, input.x())?;
        self.weighting.fprop(input, &mut self.mean)?;
        Module2::<T>::fprop(&mut self.diff, input, &self.mean, output)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.mean.prepare_dx()?;
        clear_weighting(&self.weighting, false)?;
        Module2::<T>::bprop(&mut self.diff, input, &mut self.mean, output)?;
        self.weighting.bprop(input, &self.mean)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.mean.prepare_ddx()?;
        clear_weighting(&self.weighting, true)?;
        Module2::<T>::bbprop(&mut self.diff, input, &mut self.mean, output)?;
        self.weighting.bbprop(input, &self.mean)
    }

    fn describe(&self) -> String {
        format!("subtractive_norm module {} with {}", self.name, self.config.describe())
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        self.weighting.fprop_size(input)
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        self.weighting.bprop_size(output)
    }
}

/// Divides by the gaussian-weighted local standard deviation.
pub struct DivisiveNormModule<T: Element> {
    name: String,
    config: NormConfig,
    adaptive: bool,
    epsilon: T,
    weighting: Layers<T>,
    square: PowerModule<T>,
    sqrt: PowerModule<T>,
    thres: ThresModule<T>,
    inverse: PowerModule<T>,
    mul: MulModule,
    insq: State<T>,
    invar: State<T>,
    instd: State<T>,
    thstd: State<T>,
    invstd: State<T>,
}

impl<T: Element> DivisiveNormModule<T> {
    /// With `adaptive`, standard deviations below their mean are raised to
    /// the mean; otherwise they are raised to 1.
    pub fn new(name: impl Into<String>, config: NormConfig, adaptive: bool) -> Result<Self> {
        let name = name.into();
        let weighting = config.weighting(&name)?;
        Ok(DivisiveNormModule {
            square: PowerModule::new(format!("{}_square", name), T::from_f64(2.0)),
            sqrt: PowerModule::new(format!("{}_sqrt", name), T::from_f64(0.5)),
            thres: ThresModule::new(format!("{}_thres", name), T::one(), T::one()),
            inverse: PowerModule::new(format!("{}_inverse", name), -T::one()),
            mul: MulModule::new(format!("{}_mul", name)),
            insq: State::new(1)?,
            invar: State::new(1)?,
            instd: State::new(1)?,
            thstd: State::new(1)?,
            invstd: State::new(1)?,
            epsilon: T::from_f64(NORM_EPSILON),
            name,
            config,
            adaptive,
            weighting,
        })
    }

    pub fn set_epsilon(&mut self, epsilon: T) {
        self.epsilon = epsilon;
    }

    /// Local standard deviation from the last fprop, before thresholding.
    pub fn std(&self) -> &State<T> {
        &self.instd
    }

    fn prepare(&mut self, second: bool) -> Result<()> {
        for s in [
            &mut self.insq,
            &mut self.invar,
            &mut self.instd,
            &mut self.thstd,
            &mut self.invstd,
        ] {
            if second {
                s.prepare_ddx()?;
            } else {
                s.prepare_dx()?;
            }
        }
        clear_weighting(&self.weighting, second)
    }
}

impl<T: Element> Module<T> for DivisiveNormModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.config.check_input(&self.name, input.x())?;
        self.square.fprop(input, &mut self.insq)?;
        self.weighting.fprop(&self.insq, &mut self.invar)?;
        if self.epsilon != T::zero() {
            ops::addc(self.invar.x(), self.epsilon, self.invar.x())?;
        }
        self.sqrt.fprop(&self.invar, &mut self.instd)?;
        if self.adaptive {
            let n = T::from_f64(self.instd.x().elem_count() as f64);
            let mean = ops::sum(self.instd.x())? / n;
            self.thres.set_threshold(mean, mean);
        }
        self.thres.fprop(&self.instd, &mut self.thstd)?;
        self.inverse.fprop(&self.thstd, &mut self.invstd)?;
        Module2::<T>::fprop(&mut self.mul, input, &self.invstd, output)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.prepare(false)?;
        Module2::<T>::bprop(&mut self.mul, input, &mut self.invstd, output)?;
        self.inverse.bprop(&mut self.thstd, &self.invstd)?;
        self.thres.bprop(&mut self.instd, &self.thstd)?;
        self.sqrt.bprop(&mut self.invar, &self.instd)?;
        self.weighting.bprop(&mut self.insq, &self.invar)?;
        self.square.bprop(input, &self.insq)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.prepare(true)?;
        Module2::<T>::bbprop(&mut self.mul, input, &mut self.invstd, output)?;
        self.inverse.bbprop(&mut self.thstd, &self.invstd)?;
        self.thres.bbprop(&mut self.instd, &self.thstd)?;
        self.sqrt.bbprop(&mut self.invar, &self.instd)?;
        self.weighting.bbprop(&mut self.insq, &self.invar)?;
        self.square.bbprop(input, &self.insq)
    }

    fn describe(&self) -> String {
        format!(
            "divisive_norm module {} with {}, {} threshold",
            self.name,
            self.config.describe(),
            if self.adaptive { "adaptive" } else { "unit" }
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        self.weighting.fprop_size(input)
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        self.weighting.bprop_size(output)
    }
}
