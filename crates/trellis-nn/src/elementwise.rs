// Elementwise combination modules
//
// DiffModule and MulModule take two same-shaped inputs. FsumModule sums
// groups of feature maps and broadcasts each group's sum back over its
// members, a building block for contrast normalisation.

use trellis_core::{ops, Error, Result, Tensor};

use crate::module::{resize_output, Module, Module2};
use crate::state::State;
use crate::Element;

fn check_pair<T: Element>(a: &State<T>, b: &State<T>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().clone(),
            got: b.shape().clone(),
        });
    }
    Ok(())
}

/// out = in1 - in2
pub struct DiffModule {
    name: String,
}

impl DiffModule {
    pub fn new(name: impl Into<String>) -> Self {
        DiffModule { name: name.into() }
    }
}

impl<T: Element> Module2<T> for DiffModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, in1: &State<T>, in2: &State<T>, output: &mut State<T>) -> Result<()> {
        check_pair(in1, in2)?;
        resize_output(&self.name, output, in1.shape().clone())?;
        ops::sub(in1.x(), in2.x(), output.x())
    }

    fn bprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()> {
        let g = output.dx()?;
        ops::add_acc(g, in1.dx()?)?;
        ops::sub_acc(g, in2.dx()?)
    }

    fn bbprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()> {
        let g = output.ddx()?;
        ops::add_acc(g, in1.ddx()?)?;
        ops::add_acc(g, in2.ddx()?)
    }

    fn describe(&self) -> String {
        format!("diff module {}", self.name)
    }
}

/// out = in1 * in2 (elementwise)
pub struct MulModule {
    name: String,
}

impl MulModule {
    pub fn new(name: impl Into<String>) -> Self {
        MulModule { name: name.into() }
    }
}

impl<T: Element> Module2<T> for MulModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, in1: &State<T>, in2: &State<T>, output: &mut State<T>) -> Result<()> {
        check_pair(in1, in2)?;
        resize_output(&self.name, output, in1.shape().clone())?;
        ops::mul(in1.x(), in2.x(), output.x())
    }

    fn bprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()> {
        let g = output.dx()?;
        ops::mul_acc(g, in2.x(), in1.dx()?)?;
        ops::mul_acc(g, in1.x(), in2.dx()?)
    }

    fn bbprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()> {
        let g = output.ddx()?;
        ops::sqr_mul_acc(g, in2.x(), in1.ddx()?)?;
        ops::sqr_mul_acc(g, in1.x(), in2.ddx()?)
    }

    fn describe(&self) -> String {
        format!("mul module {}", self.name)
    }
}

/// Sum over groups of consecutive feature maps.
///
/// With `n` input features, groups hold `max(2, floor(n * split))` features
/// (`split == 1` makes one group of all features; the last group may be
/// shorter). Every feature of a group receives the group's sum, divided by
/// the group size when `div` is set.
pub struct FsumModule {
    name: String,
    div: bool,
    split: f64,
}

impl FsumModule {
    pub fn new(name: impl Into<String>, div: bool, split: f64) -> Self {
        FsumModule {
            name: name.into(),
            div,
            split,
        }
    }

    /// (start, len) of each group for `n` features.
    fn groups(&self, n: usize) -> Vec<(usize, usize)> {
        let size = if self.split >= 1.0 {
            n
        } else {
            ((n as f64 * self.split).floor() as usize).max(2)
        };
        let size = size.max(1);
        (0..n).step_by(size).map(|s| (s, size.min(n - s))).collect()
    }

    /// For every group: sum `src` over its features, scale by `coeff(len)`
    /// and add the result into each of the group's features in `dst`.
    fn spread<T: Element>(
        &self,
        src: &Tensor<T>,
        dst: &Tensor<T>,
        coeff: impl Fn(usize) -> T,
    ) -> Result<()> {
        if src.rank() == 0 {
            return Err(Error::DimOutOfRange { dim: 0, rank: 0 });
        }
        let scratch = Tensor::<T>::zeros(src.shape().remove_dim(0)?)?;
        for (start, len) in self.groups(src.dims()[0]) {
            ops::clear(&scratch)?;
            for f in start..start + len {
                ops::add_acc(&src.select(0, f)?, &scratch)?;
            }
            let c = coeff(len);
            for f in start..start + len {
                ops::dotc_acc(&scratch, c, &dst.select(0, f)?)?;
            }
        }
        Ok(())
    }

    fn coeff<T: Element>(&self, len: usize) -> T {
        if self.div {
            T::one() / T::from_f64(len as f64)
        } else {
            T::one()
        }
    }
}

impl<T: Element> Module<T> for FsumModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        resize_output(&self.name, output, input.shape().clone())?;
        ops::clear(output.x())?;
        self.spread(input.x(), output.x(), |len| self.coeff::<T>(len))
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.spread(output.dx()?, input.dx()?, |len| self.coeff::<T>(len))
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.spread(output.ddx()?, input.ddx()?, |len| {
            let c = self.coeff::<T>(len);
            c * c
        })
    }

    fn describe(&self) -> String {
        format!(
            "fsum module {} (divide: {}, split: {})",
            self.name, self.div, self.split
        )
    }
}
