// Border modules: zero padding, mirror padding and border cropping
//
// All three act on the last two (spatial) axes and leave leading axes
// alone. Each backward pass is the exact adjoint of its forward mapping:
// padding accumulates the gradient of the interior (and, for mirror
// padding, of every reflected border pixel) back onto the input; cropping
// accumulates the output gradient into the interior of the input.

use trellis_core::{bail, ops, Error, Result, Shape, Tensor};

use crate::module::{resize_output, Module};
use crate::state::State;
use crate::Element;

/// Axes holding rows and columns.
fn spatial_axes(shape: &Shape) -> Result<(usize, usize)> {
    let r = shape.rank();
    if r < 2 {
        return Err(Error::RankMismatch { expected: 2, got: r });
    }
    Ok((r - 2, r - 1))
}

fn grow(shape: &Shape, rows: isize, cols: isize) -> Result<Shape> {
    let (ai, aj) = spatial_axes(shape)?;
    let d = shape.dims();
    let (ni, nj) = (d[ai] as isize + rows, d[aj] as isize + cols);
    if ni <= 0 || nj <= 0 {
        bail!("border of {}x{} does not fit {}", -rows, -cols, shape);
    }
    shape.with_dim(ai, ni as usize)?.with_dim(aj, nj as usize)
}

/// Interior `[.., rows, cols]` window of `t` starting at (top, left).
fn interior<T: Element>(t: &Tensor<T>, top: usize, left: usize, rows: usize, cols: usize) -> Result<Tensor<T>> {
    let (ai, aj) = spatial_axes(t.shape())?;
    t.narrow(ai, rows, top)?.narrow(aj, cols, left)
}

fn spatial<T: Element>(t: &Tensor<T>) -> Result<(usize, usize)> {
    let (ai, aj) = spatial_axes(t.shape())?;
    Ok((t.dims()[ai], t.dims()[aj]))
}

/// Zero padding.
pub struct ZpadModule {
    name: String,
    top: usize,
    left: usize,
    bottom: usize,
    right: usize,
}

impl ZpadModule {
    pub fn new(name: impl Into<String>, top: usize, left: usize, bottom: usize, right: usize) -> Self {
        ZpadModule {
            name: name.into(),
            top,
            left,
            bottom,
            right,
        }
    }

    /// Padding that keeps the spatial size through a convolution with
    /// `kernel`. Even kernels get one row/column less at the bottom/right.
    pub fn from_kernel(name: impl Into<String>, kernel: impl Into<Shape>) -> Result<Self> {
        let kernel = kernel.into();
        if kernel.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: kernel.rank(),
            });
        }
        let (ki, kj) = (kernel.dims()[0], kernel.dims()[1]);
        let (top, left) = (ki / 2, kj / 2);
        let bottom = if ki % 2 == 0 { top.saturating_sub(1) } else { top };
        let right = if kj % 2 == 0 { left.saturating_sub(1) } else { left };
        Ok(ZpadModule::new(name, top, left, bottom, right))
    }

    /// (top, left, bottom, right)
    pub fn paddings(&self) -> (usize, usize, usize, usize) {
        (self.top, self.left, self.bottom, self.right)
    }

    fn accumulate<T: Element>(&self, grad: &Tensor<T>, acc: &Tensor<T>) -> Result<()> {
        let (ni, nj) = spatial(acc)?;
        ops::add_acc(&interior(grad, self.top, self.left, ni, nj)?, acc)
    }
}

impl<T: Element> Module<T> for ZpadModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        let shape = Module::<T>::fprop_size(self, input.shape())?;
        resize_output(&self.name, output, shape)?;
        ops::clear(output.x())?;
        let (ni, nj) = spatial(input.x())?;
        ops::copy(input.x(), &interior(output.x(), self.top, self.left, ni, nj)?)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.accumulate(output.dx()?, input.dx()?)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.accumulate(output.ddx()?, input.ddx()?)
    }

    fn describe(&self) -> String {
        format!(
            "zpad module {} with borders top {} left {} bottom {} right {}",
            self.name, self.top, self.left, self.bottom, self.right
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        grow(
            input,
            (self.top + self.bottom) as isize,
            (self.left + self.right) as isize,
        )
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        grow(
            output,
            -((self.top + self.bottom) as isize),
            -((self.left + self.right) as isize),
        )
    }
}

/// Mirror padding: borders reflect the input about its edge row/column
/// without repeating it (`c b | a b c d | c b`).
pub struct MirrorpadModule {
    name: String,
    nrow: usize,
    ncol: usize,
}

impl MirrorpadModule {
    /// Pad `nrow` rows above and below, `ncol` columns left and right.
    pub fn new(name: impl Into<String>, nrow: usize, ncol: usize) -> Self {
        MirrorpadModule {
            name: name.into(),
            nrow,
            ncol,
        }
    }

    /// Source index of each output position along an axis of length `n`.
    fn reflect(n: usize, pad: usize) -> Vec<usize> {
        (0..n + 2 * pad)
            .map(|o| {
                let i = o as isize - pad as isize;
                if i < 0 {
                    (-i) as usize
                } else if i as usize >= n {
                    2 * (n - 1) - i as usize
                } else {
                    i as usize
                }
            })
            .collect()
    }

    fn check<T: Element>(&self, x: &Tensor<T>) -> Result<(usize, usize)> {
        let (ni, nj) = spatial(x)?;
        if self.nrow >= ni || self.ncol >= nj {
            bail!(
                "{}: mirror padding {}x{} needs an input larger than {}x{}",
                self.name,
                self.nrow,
                self.ncol,
                ni,
                nj
            );
        }
        Ok((ni, nj))
    }

    /// Calls `visit(out_part, in_part)` for every output pixel and its
    /// source pixel. The unreflected columns of a row go as one slab.
    fn walk<T: Element>(
        &self,
        input: &Tensor<T>,
        output: &Tensor<T>,
        mut visit: impl FnMut(&Tensor<T>, &Tensor<T>) -> Result<()>,
    ) -> Result<()> {
        let (ni, nj) = self.check(input)?;
        let (ai, _) = spatial_axes(input.shape())?;
        let rmap = Self::reflect(ni, self.nrow);
        let cmap = Self::reflect(nj, self.ncol);
        // the row axis is gone after select, columns move to ai
        for (r, &src_r) in rmap.iter().enumerate() {
            let orow = output.select(ai, r)?;
            let irow = input.select(ai, src_r)?;
            visit(&orow.narrow(ai, nj, self.ncol)?, &irow)?;
            for (c, &src_c) in cmap.iter().enumerate() {
                if c < self.ncol || c >= self.ncol + nj {
                    visit(&orow.select(ai, c)?, &irow.select(ai, src_c)?)?;
                }
            }
        }
        Ok(())
    }
}

impl<T: Element> Module<T> for MirrorpadModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.check(input.x())?;
        let shape = Module::<T>::fprop_size(self, input.shape())?;
        resize_output(&self.name, output, shape)?;
        self.walk(input.x(), output.x(), |o, i| ops::copy(i, o))
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.walk(input.dx()?, output.dx()?, |o, i| ops::add_acc(o, i))
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.walk(input.ddx()?, output.ddx()?, |o, i| ops::add_acc(o, i))
    }

    fn describe(&self) -> String {
        format!(
            "mirrorpad module {} with {} rows and {} columns",
            self.name, self.nrow, self.ncol
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        grow(input, 2 * self.nrow as isize, 2 * self.ncol as isize)
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        grow(output, -2 * self.nrow as isize, -2 * self.ncol as isize)
    }
}

/// Removes `nrow` rows from top and bottom and `ncol` columns from left
/// and right.
pub struct CutborderModule {
    name: String,
    nrow: usize,
    ncol: usize,
}

impl CutborderModule {
    pub fn new(name: impl Into<String>, nrow: usize, ncol: usize) -> Self {
        CutborderModule {
            name: name.into(),
            nrow,
            ncol,
        }
    }

    fn inner<T: Element>(&self, t: &Tensor<T>) -> Result<Tensor<T>> {
        let (ni, nj) = spatial(t)?;
        if ni <= 2 * self.nrow || nj <= 2 * self.ncol {
            bail!(
                "{}: cannot cut {}x{} borders from {}x{}",
                self.name,
                self.nrow,
                self.ncol,
                ni,
                nj
            );
        }
        interior(t, self.nrow, self.ncol, ni - 2 * self.nrow, nj - 2 * self.ncol)
    }
}

impl<T: Element> Module<T> for CutborderModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        let src = self.inner(input.x())?;
        resize_output(&self.name, output, src.shape().clone())?;
        ops::copy(&src, output.x())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::add_acc(output.dx()?, &self.inner(input.dx()?)?)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::add_acc(output.ddx()?, &self.inner(input.ddx()?)?)
    }

    fn describe(&self) -> String {
        format!(
            "cutborder module {} with {} rows and {} columns",
            self.name, self.nrow, self.ncol
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        grow(input, -2 * self.nrow as isize, -2 * self.ncol as isize)
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        grow(output, 2 * self.nrow as isize, 2 * self.ncol as isize)
    }
}
