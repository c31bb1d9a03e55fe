// ModuleTester: finite-difference check of hand-written derivatives
//
// For a module f with input x (n values) and output y (m values) the tester
// builds the m x n Jacobian twice:
//
//   bprop:  row j  = in.dx after bprop with out.dx = e_j
//   fd:     col i  = (f(x + h e_i) - f(x - h e_i)) / 2h
//
// and reports the largest and the summed absolute difference. The same is
// done with respect to the module's parameters. h is `Element::FD_STEP`,
// the pass threshold `Element::JACOBIAN_TOL` unless overridden.
//
// The bbprop check reuses the bprop rows: for a single module the diagonal
// Gauss-Newton term is exactly
//
//   in.ddx[i] = sum_j J[j][i]^2 * out.ddx[j]
//
// Composite modules (chains, normalisation) square each member's Jacobian
// separately, so only their first-order pass is comparable.
//
// Inputs are drawn from U(-2, 2) and parameters are reinitialised with
// forget(value 2, exponent 0.5) before each check.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use trellis_core::{ops, Result, Tensor};

use crate::forget::ForgetParam;
use crate::module::Module;
use crate::state::State;
use crate::Element;

/// Outcome of one Jacobian comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JacobianReport {
    pub max_abs_err: f64,
    pub total_err: f64,
    pub tolerance: f64,
}

impl JacobianReport {
    pub fn passed(&self) -> bool {
        self.max_abs_err <= self.tolerance
    }
}

impl fmt::Display for JacobianReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max abs error {:e}, total error {:e} (tolerance {:e}): {}",
            self.max_abs_err,
            self.total_err,
            self.tolerance,
            if self.passed() { "ok" } else { "FAILED" }
        )
    }
}

/// Finite-difference Jacobian checker.
pub struct ModuleTester {
    tolerance: Option<f64>,
    range: (f64, f64),
    rng: StdRng,
}

impl ModuleTester {
    pub fn new(seed: u64) -> Self {
        ModuleTester {
            tolerance: None,
            range: (-2.0, 2.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Override the per-precision pass threshold.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Draw inputs from U(lo, hi) instead of U(-2, 2).
    pub fn with_input_range(mut self, lo: f64, hi: f64) -> Self {
        self.range = (lo, hi);
        self
    }

    fn randomize<T: Element>(&mut self, t: &Tensor<T>) -> Result<()> {
        let (lo, hi) = self.range;
        let rng = &mut self.rng;
        ops::apply1(t, |v| *v = T::from_f64(rng.gen_range(lo..=hi)))
    }

    fn prepare<T: Element, M: Module<T> + ?Sized>(
        &mut self,
        module: &mut M,
        input: &mut State<T>,
        output: &mut State<T>,
    ) -> Result<()> {
        self.randomize(input.x())?;
        module.forget(&mut ForgetParam::with_seed(2.0, 0.5, self.rng.gen()))?;
        module.fprop(input, output)
    }

    fn report<T: Element>(&self, bprop: &[Vec<f64>], fd: &[Vec<f64>]) -> JacobianReport {
        let mut max_abs_err = 0f64;
        let mut total_err = 0f64;
        for (b, f) in bprop.iter().zip(fd) {
            for (x, y) in b.iter().zip(f) {
                let e = (x - y).abs();
                max_abs_err = max_abs_err.max(e);
                total_err += e;
            }
        }
        JacobianReport {
            max_abs_err,
            total_err,
            tolerance: self.tolerance.unwrap_or(T::JACOBIAN_TOL),
        }
    }

    /// Rows of the Jacobian from bprop: `collect` reads the derivatives of
    /// interest after each one-hot backward pass.
    fn bprop_rows<T: Element, M: Module<T> + ?Sized>(
        module: &mut M,
        input: &mut State<T>,
        output: &mut State<T>,
        params: &[Tensor<T>],
        collect: impl Fn(&State<T>) -> Result<Vec<f64>>,
    ) -> Result<Vec<Vec<f64>>> {
        let m = output.x().elem_count();
        let mut rows = Vec::with_capacity(m);
        for j in 0..m {
            output.prepare_dx()?;
            output.dx()?.flatten()?.set(&[j], T::one())?;
            input.prepare_dx()?;
            for dx in params {
                ops::clear(dx)?;
            }
            module.bprop(input, output)?;
            rows.push(collect(&*input)?);
        }
        Ok(rows)
    }

    /// Columns of the Jacobian by centred differences on `target`.
    fn fd_columns<T: Element, M: Module<T> + ?Sized>(
        module: &mut M,
        input: &State<T>,
        output: &mut State<T>,
        target: &Tensor<T>,
    ) -> Result<Vec<Vec<f64>>> {
        let h = T::FD_STEP;
        let base = target.to_vec()?;
        let mut cols = Vec::with_capacity(base.len());
        let eval = |k: usize, delta: f64, module: &mut M, output: &mut State<T>| -> Result<Vec<f64>> {
            let mut v = base.clone();
            v[k] = T::from_f64(v[k].to_f64() + delta);
            ops::copy(&Tensor::from_vec(v, target.shape().clone())?, target)?;
            module.fprop(input, output)?;
            Ok(output.x().to_vec()?.into_iter().map(|y| y.to_f64()).collect())
        };
        for k in 0..base.len() {
            let plus = eval(k, h, module, output)?;
            let minus = eval(k, -h, module, output)?;
            cols.push(
                plus.iter()
                    .zip(&minus)
                    .map(|(p, q)| (p - q) / (2.0 * h))
                    .collect::<Vec<_>>(),
            );
        }
        ops::copy(&Tensor::from_vec(base, target.shape().clone())?, target)?;
        module.fprop(input, output)?;
        Ok(cols)
    }

    /// Compare the input Jacobian from bprop with finite differences.
    pub fn test_jacobian<T: Element, M: Module<T> + ?Sized>(
        &mut self,
        module: &mut M,
        input: &mut State<T>,
        output: &mut State<T>,
    ) -> Result<JacobianReport> {
        self.prepare(module, input, output)?;
        let params: Vec<Tensor<T>> = module
            .parameters()
            .iter()
            .map(|p| p.dx().cloned())
            .collect::<Result<_>>()?;
        let rows = Self::bprop_rows(module, input, output, &params, |s| {
            Ok(s.dx()?.to_vec()?.into_iter().map(|v| v.to_f64()).collect())
        })?;
        // perturbed through an alias of the input value
        let target = input.x().clone();
        let cols = Self::fd_columns(module, input, output, &target)?;
        let report = self.report::<T>(&rows, &transpose(&cols));
        log::debug!("{}: input jacobian {}", module.name(), report);
        Ok(report)
    }

    /// Compare the parameter Jacobian from bprop with finite differences.
    pub fn test_jacobian_param<T: Element, M: Module<T> + ?Sized>(
        &mut self,
        module: &mut M,
        input: &mut State<T>,
        output: &mut State<T>,
    ) -> Result<JacobianReport> {
        self.prepare(module, input, output)?;
        // aliases of the parameter buffers, usable while the module is borrowed
        let (xs, dxs): (Vec<Tensor<T>>, Vec<Tensor<T>>) = module
            .parameters()
            .iter()
            .map(|p| -> Result<(Tensor<T>, Tensor<T>)> { Ok((p.x().clone(), p.dx()?.clone())) })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        let collect_dxs = dxs.clone();
        let rows = Self::bprop_rows(module, input, output, &dxs, move |_| {
            let mut row = Vec::new();
            for dx in &collect_dxs {
                row.extend(dx.to_vec()?.into_iter().map(|v| v.to_f64()));
            }
            Ok(row)
        })?;
        let mut cols = Vec::new();
        for x in &xs {
            cols.extend(Self::fd_columns(module, input, output, x)?);
        }
        let report = self.report::<T>(&rows, &transpose(&cols));
        log::debug!("{}: parameter jacobian {}", module.name(), report);
        Ok(report)
    }

    /// Compare input-side bbprop with the squared bprop Jacobian.
    pub fn test_bbprop<T: Element, M: Module<T> + ?Sized>(
        &mut self,
        module: &mut M,
        input: &mut State<T>,
        output: &mut State<T>,
    ) -> Result<JacobianReport> {
        self.prepare(module, input, output)?;
        let params: Vec<Tensor<T>> = module
            .parameters()
            .iter()
            .map(|p| p.dx().cloned())
            .collect::<Result<_>>()?;
        let rows = Self::bprop_rows(module, input, output, &params, |s| {
            Ok(s.dx()?.to_vec()?.into_iter().map(|v| v.to_f64()).collect())
        })?;
        let ddout = self.curvature_seed(output)?;
        input.prepare_ddx()?;
        for p in module.parameters() {
            p.zero_ddx()?;
        }
        module.bbprop(input, output)?;
        let got: Vec<f64> = input.ddx()?.to_vec()?.into_iter().map(|v| v.to_f64()).collect();
        let report = self.report::<T>(&[got], &[squared_rows(&rows, &ddout)]);
        log::debug!("{}: input curvature {}", module.name(), report);
        Ok(report)
    }

    /// Compare parameter-side bbprop with the squared bprop Jacobian.
    pub fn test_bbprop_param<T: Element, M: Module<T> + ?Sized>(
        &mut self,
        module: &mut M,
        input: &mut State<T>,
        output: &mut State<T>,
    ) -> Result<JacobianReport> {
        self.prepare(module, input, output)?;
        let (dxs, ddxs): (Vec<Tensor<T>>, Vec<Tensor<T>>) = module
            .parameters()
            .iter()
            .map(|p| -> Result<(Tensor<T>, Tensor<T>)> { Ok((p.dx()?.clone(), p.ddx()?.clone())) })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        let collect_dxs = dxs.clone();
        let rows = Self::bprop_rows(module, input, output, &dxs, move |_| {
            let mut row = Vec::new();
            for dx in &collect_dxs {
                row.extend(dx.to_vec()?.into_iter().map(|v| v.to_f64()));
            }
            Ok(row)
        })?;
        let ddout = self.curvature_seed(output)?;
        input.prepare_ddx()?;
        for ddx in &ddxs {
            ops::clear(ddx)?;
        }
        module.bbprop(input, output)?;
        let mut got = Vec::new();
        for ddx in &ddxs {
            got.extend(ddx.to_vec()?.into_iter().map(|v| v.to_f64()));
        }
        let report = self.report::<T>(&[got], &[squared_rows(&rows, &ddout)]);
        log::debug!("{}: parameter curvature {}", module.name(), report);
        Ok(report)
    }

    /// Fill `output.ddx` with draws from U(0.5, 1.5) and return them.
    fn curvature_seed<T: Element>(&mut self, output: &mut State<T>) -> Result<Vec<f64>> {
        output.prepare_ddx()?;
        let rng = &mut self.rng;
        ops::apply1(output.ddx()?, |v| *v = T::from_f64(rng.gen_range(0.5..=1.5)))?;
        Ok(output.ddx()?.to_vec()?.into_iter().map(|v| v.to_f64()).collect())
    }
}

/// sum_j rows[j][i]^2 * weights[j] for every column i.
fn squared_rows(rows: &[Vec<f64>], weights: &[f64]) -> Vec<f64> {
    let n = rows.first().map_or(0, |r| r.len());
    let mut acc = vec![0.0; n];
    for (row, w) in rows.iter().zip(weights) {
        for (a, j) in acc.iter_mut().zip(row) {
            *a += j * j * w;
        }
    }
    acc
}

/// Columns -> rows.
fn transpose(cols: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let m = cols.first().map_or(0, |c| c.len());
    (0..m).map(|j| cols.iter().map(|c| c[j]).collect()).collect()
}
