// ConvolutionModule: 2D correlation wired by a connection table
//
// Input [features, rows, cols], output [thickness, out_rows, out_cols].
// Each table entry k = (i, o) owns kernel k and adds the correlation of
// input map i with that kernel into output map o.
//
// Everything is expressed on unfolded views. Unfolding the two spatial axes
// of the input by (kernel, stride) gives a [features, Oi, Oj, ki, kj] view
// in which each output pixel's receptive field is a trailing [ki, kj]
// window, with no data copied:
//
//   fprop    out[o]    += m4dot(windows(in.x)[i], kernel[k])
//   bprop    windows(in.dx)[i] += outer(out.dx[o], kernel[k])
//            kernel.dx[k]      += m4dot(windows(in.x)[i] permuted to
//                                       [ki, kj, Oi, Oj], out.dx[o])
//   bbprop   same as bprop, with the kernel squared on the input path and
//            the input squared on the kernel path (diagonal Gauss-Newton)
//
// OUTPUT SIZE:
//
//   O = (n - k) / s + 1 per spatial axis. When the stride does not divide
//   n - k, the trailing rows/cols are cropped (the default) or the input is
//   rejected. A kernel larger than the input yields one blank pixel per
//   output map and no computation.
//
// PARALLELISM (feature `parallel`, opt-in per module):
//
//   Table entries are correlated concurrently, each into a private scratch
//   map; a second parallel pass reduces the scratch maps per output feature.
//   Entries targeting the same output never write to a shared buffer.

use std::collections::BTreeSet;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use trellis_core::{bail, contract, ops, Error, Result, Shape, Tensor};

use crate::forget::ForgetParam;
use crate::module::{expect_rank, expect_weights, load_partial, resize_output, Module};
use crate::parameter::Parameter;
use crate::state::State;
use crate::table::ConnectionTable;
use crate::Element;

/// How an input of a given size maps onto the kernel windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Geometry {
    /// Kernel larger than the input: one blank output pixel per map.
    Degenerate,
    /// `rows x cols` of the input are used, giving `oi x oj` windows.
    Windows {
        rows: usize,
        cols: usize,
        oi: usize,
        oj: usize,
    },
}

/// Table-driven 2D convolution (correlation) without bias.
pub struct ConvolutionModule<T: Element> {
    name: String,
    kernel: State<T>,
    table: ConnectionTable,
    ker: [usize; 2],
    stride: [usize; 2],
    tablemax: usize,
    thickness: usize,
    fulltable: bool,
    crop: bool,
    parallel: bool,
    warned_thickness: bool,
    warned_degenerate: bool,
    warned_crop: bool,
}

fn pair(shape: Shape, what: &str) -> Result<[usize; 2]> {
    if shape.rank() != 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: shape.rank(),
        });
    }
    let d = shape.dims();
    if d[0] == 0 || d[1] == 0 {
        bail!("{} must be positive, got {}", what, shape);
    }
    Ok([d[0], d[1]])
}

impl<T: Element> ConvolutionModule<T> {
    /// Create one `kernel`-sized filter per table entry.
    ///
    /// # Arguments
    /// - `kernel`: [ki, kj] kernel extents
    /// - `stride`: [si, sj] window step
    /// - `table`: (input, output) feature pairs; must not be empty
    /// - `param`: shared parameter buffer, or `None` for private storage
    pub fn new(
        name: impl Into<String>,
        kernel: impl Into<Shape>,
        stride: impl Into<Shape>,
        table: ConnectionTable,
        param: Option<&mut Parameter<T>>,
    ) -> Result<Self> {
        let name = name.into();
        let ker = pair(kernel.into(), "kernel size")?;
        let stride = pair(stride.into(), "stride")?;
        let (tablemax, thickness) = match (table.max_input(), table.max_output()) {
            (Some(i), Some(o)) => (i, o + 1),
            _ => {
                return Err(Error::InvalidTable(format!(
                    "{}: empty connection table",
                    name
                )))
            }
        };

        let unused: Vec<usize> = (0..=tablemax).filter(|&i| table.fan_out(i) == 0).collect();
        if !unused.is_empty() {
            log::warn!("{}: connection table does not use inputs {:?}", name, unused);
        }
        let starved: Vec<usize> = (0..thickness).filter(|&o| table.fan_in(o) == 0).collect();
        if !starved.is_empty() {
            log::warn!("{}: outputs {:?} receive no input and stay zero", name, starved);
        }

        let full: BTreeSet<_> = ConnectionTable::full(tablemax + 1, thickness)
            .pairs()
            .iter()
            .copied()
            .collect();
        let given: BTreeSet<_> = table.pairs().iter().copied().collect();
        let fulltable = given == full && table.len() == full.len();

        let shape = Shape::from((table.len(), ker[0], ker[1]));
        let kernel = match param {
            Some(p) => State::with_parameter(shape, p)?,
            None => State::with_derivatives(shape)?,
        };
        Ok(ConvolutionModule {
            name,
            kernel,
            table,
            ker,
            stride,
            tablemax,
            thickness,
            fulltable,
            crop: true,
            parallel: false,
            warned_thickness: false,
            warned_degenerate: false,
            warned_crop: false,
        })
    }

    /// Reject (instead of cropping) inputs the stride does not divide.
    pub fn set_crop(&mut self, crop: bool) {
        self.crop = crop;
    }

    /// Correlate table entries on the rayon thread pool.
    #[cfg(feature = "parallel")]
    pub fn set_parallel(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    pub fn kernel(&self) -> &State<T> {
        &self.kernel
    }

    /// [ki, kj]
    pub fn kernel_size(&self) -> [usize; 2] {
        self.ker
    }

    /// [si, sj]
    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Number of output feature maps.
    pub fn thickness(&self) -> usize {
        self.thickness
    }

    /// Number of input feature maps the table reads.
    pub fn input_features(&self) -> usize {
        self.tablemax + 1
    }

    /// True when every input feeds every output exactly once.
    pub fn is_full_table(&self) -> bool {
        self.fulltable
    }

    fn geometry(&self, dims: &[usize]) -> Result<Geometry> {
        let (ni, nj) = (dims[1], dims[2]);
        let [ki, kj] = self.ker;
        let [si, sj] = self.stride;
        if ki > ni || kj > nj {
            return Ok(Geometry::Degenerate);
        }
        let (ri, rj) = ((ni - ki) % si, (nj - kj) % sj);
        if (ri != 0 || rj != 0) && !self.crop {
            bail!(
                "{}: inconsistent input size, kernel size, and subsampling ratio ({}x{} input, {}x{} kernel, {}x{} stride)",
                self.name, ni, nj, ki, kj, si, sj
            );
        }
        Ok(Geometry::Windows {
            rows: ni - ri,
            cols: nj - rj,
            oi: (ni - ki) / si + 1,
            oj: (nj - kj) / sj + 1,
        })
    }

    fn check_input(&mut self, input: &Tensor<T>) -> Result<Geometry> {
        expect_rank(input, 3)?;
        let features = input.dims()[0];
        if features <= self.tablemax {
            bail!(
                "{}: input has {} features but the table reads feature {}",
                self.name,
                features,
                self.tablemax
            );
        }
        if features > self.tablemax + 1 && !self.warned_thickness {
            log::warn!(
                "{}: input has {} features, only the first {} are used",
                self.name,
                features,
                self.tablemax + 1
            );
            self.warned_thickness = true;
        }
        self.geometry(input.dims())
    }

    /// [features, oi, oj, ki, kj] windows over the used region of `t`.
    fn windows(&self, t: &Tensor<T>, rows: usize, cols: usize) -> Result<Tensor<T>> {
        t.narrow(1, rows, 0)?
            .narrow(2, cols, 0)?
            .unfold(1, self.ker[0], self.stride[0])?
            .unfold(2, self.ker[1], self.stride[1])
    }

    fn correlate_serial(&self, windows: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
        for (k, &(i, o)) in self.table.pairs().iter().enumerate() {
            contract::m4dotm2acc(
                &windows.select(0, i)?,
                &self.kernel.x().select(0, k)?,
                &out.select(0, o)?,
            )?;
        }
        Ok(())
    }

    #[cfg(feature = "parallel")]
    fn correlate_parallel(&self, windows: &Tensor<T>, out: &Tensor<T>, oi: usize, oj: usize) -> Result<()> {
        let scratch: Vec<Tensor<T>> = self
            .table
            .pairs()
            .par_iter()
            .enumerate()
            .map(|(k, &(i, _))| -> Result<Tensor<T>> {
                let acc = Tensor::zeros((oi, oj))?;
                contract::m4dotm2acc(&windows.select(0, i)?, &self.kernel.x().select(0, k)?, &acc)?;
                Ok(acc)
            })
            .collect::<Result<_>>()?;
        let reduced: Vec<Tensor<T>> = (0..self.thickness)
            .into_par_iter()
            .map(|o| -> Result<Tensor<T>> {
                let acc = Tensor::zeros((oi, oj))?;
                for (k, &(_, target)) in self.table.pairs().iter().enumerate() {
                    if target == o {
                        ops::add_acc(&scratch[k], &acc)?;
                    }
                }
                Ok(acc)
            })
            .collect::<Result<_>>()?;
        for (o, acc) in reduced.iter().enumerate() {
            ops::copy(acc, &out.select(0, o)?)?;
        }
        Ok(())
    }

    #[cfg_attr(not(feature = "parallel"), allow(unused_variables))]
    fn correlate(&self, windows: &Tensor<T>, out: &Tensor<T>, oi: usize, oj: usize) -> Result<()> {
        if self.parallel {
            #[cfg(feature = "parallel")]
            return self.correlate_parallel(windows, out, oi, oj);
        }
        ops::clear(out)?;
        self.correlate_serial(windows, out)
    }

    fn backward(&self, input: &State<T>, output: &State<T>, second: bool) -> Result<()> {
        expect_rank(input.x(), 3)?;
        let (rows, cols) = match self.geometry(input.dims())? {
            Geometry::Degenerate => return Ok(()),
            Geometry::Windows { rows, cols, .. } => (rows, cols),
        };
        let (in_d, out_d, ker_d) = if second {
            (input.ddx()?, output.ddx()?, self.kernel.ddx()?)
        } else {
            (input.dx()?, output.dx()?, self.kernel.dx()?)
        };
        let in_windows = self.windows(in_d, rows, cols)?;
        // [features, ki, kj, oi, oj]
        let x_windows = self.windows(input.x(), rows, cols)?.permute(&[0, 3, 4, 1, 2])?;
        for (k, &(i, o)) in self.table.pairs().iter().enumerate() {
            let g = out_d.select(0, o)?;
            let w = self.kernel.x().select(0, k)?;
            let x = x_windows.select(0, i)?;
            if second {
                contract::m2squextm2acc(&g, &w, &in_windows.select(0, i)?)?;
                contract::m4squdotm2acc(&x, &g, &ker_d.select(0, k)?)?;
            } else {
                contract::m2extm2acc(&g, &w, &in_windows.select(0, i)?)?;
                contract::m4dotm2acc(&x, &g, &ker_d.select(0, k)?)?;
            }
        }
        Ok(())
    }
}

impl<T: Element> Module<T> for ConvolutionModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        match self.check_input(input.x())? {
            Geometry::Degenerate => {
                if !self.warned_degenerate {
                    log::warn!(
                        "{}: kernel {}x{} is larger than input {}, output is blank",
                        self.name,
                        self.ker[0],
                        self.ker[1],
                        input.shape()
                    );
                    self.warned_degenerate = true;
                }
                resize_output(&self.name, output, (self.thickness, 1, 1))?;
                ops::clear(output.x())
            }
            Geometry::Windows { rows, cols, oi, oj } => {
                let dims = input.dims();
                if (rows, cols) != (dims[1], dims[2]) && !self.warned_crop {
                    log::warn!(
                        "{}: cropping input {} to {}x{} to fit kernel and stride",
                        self.name,
                        input.shape(),
                        rows,
                        cols
                    );
                    self.warned_crop = true;
                }
                resize_output(&self.name, output, (self.thickness, oi, oj))?;
                let windows = self.windows(input.x(), rows, cols)?;
                self.correlate(&windows, output.x(), oi, oj)
            }
        }
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.backward(input, output, false)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.backward(input, output, true)
    }

    fn forget(&mut self, fp: &mut ForgetParam) -> Result<()> {
        let area = self.ker[0] * self.ker[1];
        for (k, &(_, o)) in self.table.pairs().iter().enumerate() {
            fp.fill_uniform(&self.kernel.x().select(0, k)?, area * self.table.fan_in(o))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "convolution module {} with {} kernels with size {}x{}, stride {}x{} and table [{}, 2] ({}->{})",
            self.name,
            self.table.len(),
            self.ker[0],
            self.ker[1],
            self.stride[0],
            self.stride[1],
            self.table.len(),
            self.tablemax + 1,
            self.thickness
        )
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        if input.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: input.rank(),
            });
        }
        let d = input.dims();
        let out = |n: usize, k: usize, s: usize| (n.saturating_sub(k) / s + 1).max(1);
        Ok(Shape::from((
            self.thickness,
            out(d[1], self.ker[0], self.stride[0]),
            out(d[2], self.ker[1], self.stride[1]),
        )))
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        if output.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: output.rank(),
            });
        }
        let d = output.dims();
        let back = |o: usize, k: usize, s: usize| (o.max(1) - 1) * s + k;
        Ok(Shape::from((
            self.tablemax + 1,
            back(d[1], self.ker[0], self.stride[0]),
            back(d[2], self.ker[1], self.stride[1]),
        )))
    }

    fn parameters(&self) -> Vec<&State<T>> {
        vec![&self.kernel]
    }

    fn load_x(&mut self, weights: &[Tensor<T>]) -> Result<()> {
        expect_weights(&self.name, weights, 1)?;
        load_partial(&self.name, &weights[0], self.kernel.x())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: impl Into<Shape>) -> Tensor<f64> {
        let shape = shape.into();
        let n = shape.elem_count();
        Tensor::from_vec((1..=n).map(|v| v as f64).collect(), shape).unwrap()
    }

    fn single(kernel: &[f64]) -> ConvolutionModule<f64> {
        let mut m =
            ConvolutionModule::new("c", (2, 2), (1, 1), ConnectionTable::one_to_one(1), None).unwrap();
        m.load_x(&[Tensor::from_slice(kernel, (1, 2, 2)).unwrap()]).unwrap();
        m
    }

    #[test]
    fn test_fprop_correlation() {
        let mut m = single(&[1.0, 2.0, 3.0, 4.0]);
        let input = State::from_tensor(ramp((1, 3, 3)));
        let mut out = State::new((1, 1, 1)).unwrap();
        m.fprop(&input, &mut out).unwrap();
        assert_eq!(out.dims(), &[1, 2, 2]);
        // [1 2; 4 5] . [1 2; 3 4] = 1 + 4 + 12 + 20
        assert_eq!(out.x().to_vec().unwrap(), vec![37.0, 47.0, 67.0, 77.0]);
    }

    #[test]
    fn test_outputs_sum_over_table_entries() {
        let table = ConnectionTable::from_pairs(vec![(0, 0), (1, 0)]);
        let mut m = ConvolutionModule::<f64>::new("c", (1, 1), (1, 1), table, None).unwrap();
        m.load_x(&[Tensor::from_vec(vec![1.0, 10.0], (2, 1, 1)).unwrap()]).unwrap();
        let input = State::from_tensor(ramp((2, 1, 2)));
        let mut out = State::new((1, 1, 1)).unwrap();
        m.fprop(&input, &mut out).unwrap();
        assert_eq!(out.x().to_vec().unwrap(), vec![1.0 + 30.0, 2.0 + 40.0]);
    }

    #[test]
    fn test_bprop_matches_hand_computation() {
        let mut m = single(&[1.0, 2.0, 3.0, 4.0]);
        let mut input = State::from_tensor(ramp((1, 3, 3)));
        let mut out = State::new((1, 2, 2)).unwrap();
        m.fprop(&input, &mut out).unwrap();
        out.prepare_dx().unwrap();
        ops::fill(out.dx().unwrap(), 1.0).unwrap();
        input.prepare_dx().unwrap();
        m.kernel().zero_dx().unwrap();
        m.bprop(&mut input, &out).unwrap();
        assert_eq!(
            input.dx().unwrap().to_vec().unwrap(),
            vec![1.0, 3.0, 2.0, 4.0, 10.0, 6.0, 3.0, 7.0, 4.0]
        );
        // each kernel tap sees the sum of its four window positions
        assert_eq!(m.kernel().dx().unwrap().to_vec().unwrap(), vec![12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn test_bbprop_squares_kernel_and_input() {
        let mut m = single(&[1.0, 2.0, 3.0, 4.0]);
        let mut input = State::from_tensor(ramp((1, 3, 3)));
        let mut out = State::new((1, 2, 2)).unwrap();
        m.fprop(&input, &mut out).unwrap();
        out.prepare_ddx().unwrap();
        ops::fill(out.ddx().unwrap(), 2.0).unwrap();
        input.prepare_ddx().unwrap();
        m.kernel().zero_ddx().unwrap();
        m.bbprop(&mut input, &out).unwrap();
        // the bprop pattern with kernel [1, 4, 9, 16], times ddout = 2
        assert_eq!(
            input.ddx().unwrap().to_vec().unwrap(),
            vec![2.0, 10.0, 8.0, 20.0, 60.0, 40.0, 18.0, 50.0, 32.0]
        );
        // each tap sums x^2 over its four window positions, times 2
        assert_eq!(m.kernel().ddx().unwrap().to_vec().unwrap(), vec![92.0, 148.0, 308.0, 412.0]);
    }

    #[test]
    fn test_stride_crop_and_reject() {
        let mut m =
            ConvolutionModule::<f64>::new("c", (2, 2), (2, 2), ConnectionTable::one_to_one(1), None)
                .unwrap();
        let input = State::from_tensor(ramp((1, 5, 5)));
        let mut out = State::new((1, 1, 1)).unwrap();
        m.fprop(&input, &mut out).unwrap();
        assert_eq!(out.dims(), &[1, 2, 2]);
        m.set_crop(false);
        assert!(m.fprop(&input, &mut out).is_err());
    }

    #[test]
    fn test_degenerate_input_gives_blank_pixel() {
        let mut m =
            ConvolutionModule::<f64>::new("c", (5, 5), (1, 1), ConnectionTable::full(1, 3), None)
                .unwrap();
        let mut input = State::from_tensor(ramp((1, 3, 3)));
        let mut out = State::new((3, 3, 3)).unwrap();
        m.fprop(&input, &mut out).unwrap();
        assert_eq!(out.dims(), &[3, 1, 1]);
        assert_eq!(out.x().to_vec().unwrap(), vec![0.0; 3]);
        input.prepare_dx().unwrap();
        out.prepare_dx().unwrap();
        m.bprop(&mut input, &out).unwrap();
    }

    #[test]
    fn test_table_validation() {
        let empty = ConnectionTable::from_pairs(vec![]);
        assert!(matches!(
            ConvolutionModule::<f32>::new("c", (3, 3), (1, 1), empty, None),
            Err(Error::InvalidTable(_))
        ));
        let full = ConvolutionModule::<f32>::new("c", (3, 3), (1, 1), ConnectionTable::full(2, 3), None)
            .unwrap();
        assert!(full.is_full_table());
        assert_eq!(full.thickness(), 3);
        let sparse = ConvolutionModule::<f32>::new(
            "c",
            (3, 3),
            (1, 1),
            ConnectionTable::from_pairs(vec![(0, 0), (2, 1)]),
            None,
        )
        .unwrap();
        assert!(!sparse.is_full_table());
        assert_eq!(sparse.input_features(), 3);
    }

    #[test]
    fn test_input_too_thin() {
        let mut m =
            ConvolutionModule::<f64>::new("c", (1, 1), (1, 1), ConnectionTable::full(3, 1), None)
                .unwrap();
        let input = State::new((2, 4, 4)).unwrap();
        let mut out = State::new((1, 1, 1)).unwrap();
        assert!(m.fprop(&input, &mut out).is_err());
    }

    #[test]
    fn test_sizes_and_describe() {
        let m = ConvolutionModule::<f32>::new("c1", (5, 5), (1, 1), ConnectionTable::full(1, 6), None)
            .unwrap();
        assert_eq!(m.fprop_size(&Shape::from((1, 32, 32))).unwrap(), Shape::from((6, 28, 28)));
        assert_eq!(m.bprop_size(&Shape::from((6, 28, 28))).unwrap(), Shape::from((1, 32, 32)));
        assert_eq!(m.fprop_size(&Shape::from((1, 3, 3))).unwrap(), Shape::from((6, 1, 1)));
        assert_eq!(
            m.describe(),
            "convolution module c1 with 6 kernels with size 5x5, stride 1x1 and table [6, 2] (1->6)"
        );
        assert_eq!(m.num_parameters(), 150);
    }

    #[test]
    fn test_forget_bounded_by_fan_in() {
        let mut m =
            ConvolutionModule::<f64>::new("c", (2, 2), (1, 1), ConnectionTable::full(4, 2), None)
                .unwrap();
        m.forget(&mut ForgetParam::with_seed(1.0, 0.5, 5)).unwrap();
        let k = m.kernel().x().to_vec().unwrap();
        // fan-in 4 maps x 4 taps
        assert!(k.iter().all(|v| v.abs() <= 0.25));
        assert!(k.iter().any(|v| *v != 0.0));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_matches_serial() {
        let table = ConnectionTable::full(2, 3);
        let mut serial = ConvolutionModule::<f64>::new("s", (2, 2), (1, 1), table.clone(), None).unwrap();
        serial.forget(&mut ForgetParam::with_seed(1.0, 0.5, 9)).unwrap();
        let mut par = ConvolutionModule::<f64>::new("p", (2, 2), (1, 1), table, None).unwrap();
        par.load_x(&[serial.kernel().x().clone()]).unwrap();
        par.set_parallel(true);
        let input = State::from_tensor(ramp((2, 4, 5)));
        let mut a = State::new((1, 1, 1)).unwrap();
        let mut b = State::new((1, 1, 1)).unwrap();
        serial.fprop(&input, &mut a).unwrap();
        par.fprop(&input, &mut b).unwrap();
        assert_eq!(a.x().to_vec().unwrap(), b.x().to_vec().unwrap());
    }
}
