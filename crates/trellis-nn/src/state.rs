// State: a value plus its first and second derivative accumulators
//
// Every module reads and writes States. `x` always exists; `dx` and `ddx`
// are allocated on demand, the first time a backward pass needs them.
//
// Derivative buffers ACCUMULATE: bprop adds into `dx`, bbprop adds into
// `ddx`. They must be zeroed before each backward pass, otherwise gradients
// from unrelated passes pile up. `prepare_dx`/`prepare_ddx` do the
// allocate-and-zero step in one call and are what chains use when entering
// a backward pass.
//
// Reading a derivative that was never allocated, or whose shape no longer
// matches the value (the value was resized afterwards), is an error rather
// than a silent read of stale data.

use trellis_core::{ops, Error, Result, Shape, Tensor};

use crate::parameter::Parameter;
use crate::Element;

/// Value, first derivative and second derivative of one node.
#[derive(Debug, Clone)]
pub struct State<T: Element> {
    x: Tensor<T>,
    dx: Option<Tensor<T>>,
    ddx: Option<Tensor<T>>,
}

impl<T: Element> State<T> {
    /// Zero value of the given shape, no derivatives.
    pub fn new(shape: impl Into<Shape>) -> Result<Self> {
        Ok(State::from_tensor(Tensor::zeros(shape)?))
    }

    /// Zero value with both derivative buffers allocated. Used for private
    /// module parameters.
    pub fn with_derivatives(shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        Ok(State {
            x: Tensor::zeros(shape.clone())?,
            dx: Some(Tensor::zeros(shape.clone())?),
            ddx: Some(Tensor::zeros(shape)?),
        })
    }

    /// Wrap an existing view as the value. The state aliases `x`.
    pub fn from_tensor(x: Tensor<T>) -> Self {
        State {
            x,
            dx: None,
            ddx: None,
        }
    }

    /// Value and derivatives carved out of a shared parameter buffer.
    pub fn with_parameter(shape: impl Into<Shape>, param: &mut Parameter<T>) -> Result<Self> {
        param.allocate(shape)
    }

    pub(crate) fn from_parts(x: Tensor<T>, dx: Tensor<T>, ddx: Tensor<T>) -> Self {
        State {
            x,
            dx: Some(dx),
            ddx: Some(ddx),
        }
    }

    pub fn x(&self) -> &Tensor<T> {
        &self.x
    }

    pub fn shape(&self) -> &Shape {
        self.x.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.x.dims()
    }

    pub fn dim(&self, d: usize) -> Result<usize> {
        self.x.dim(d)
    }

    pub fn rank(&self) -> usize {
        self.x.rank()
    }

    pub fn has_dx(&self) -> bool {
        self.dx.is_some()
    }

    pub fn has_ddx(&self) -> bool {
        self.ddx.is_some()
    }

    fn checked<'a>(&self, buf: &'a Option<Tensor<T>>, which: &'static str) -> Result<&'a Tensor<T>> {
        let t = buf
            .as_ref()
            .ok_or(Error::DerivativeNotAllocated { which })?;
        if t.shape() != self.x.shape() {
            return Err(Error::StaleDerivative {
                which,
                expected: self.x.shape().clone(),
                got: t.shape().clone(),
            });
        }
        Ok(t)
    }

    /// First derivative. Fails if never allocated or stale.
    pub fn dx(&self) -> Result<&Tensor<T>> {
        self.checked(&self.dx, "dx")
    }

    /// Second derivative. Fails if never allocated or stale.
    pub fn ddx(&self) -> Result<&Tensor<T>> {
        self.checked(&self.ddx, "ddx")
    }

    /// Resize the value and every allocated derivative. Keeps the buffers
    /// when the rank is unchanged and the value is contiguous, otherwise
    /// reallocates. Returns true if the shape changed.
    pub fn resize(&mut self, shape: impl Into<Shape>) -> Result<bool> {
        let shape = shape.into();
        if &shape == self.shape() {
            return Ok(false);
        }
        if shape.rank() == self.rank() && self.x.is_contiguous() {
            self.x.resize(shape.clone())?;
        } else {
            self.x.reset(shape.clone())?;
        }
        for buf in [&mut self.dx, &mut self.ddx].into_iter().flatten() {
            resize_buffer(buf, &shape)?;
        }
        Ok(true)
    }

    /// Allocate `dx` at the value's shape unless it already is.
    pub fn resize_dx(&mut self) -> Result<()> {
        let shape = self.x.shape().clone();
        match &mut self.dx {
            Some(dx) => resize_buffer(dx, &shape),
            None => {
                self.dx = Some(Tensor::zeros(shape)?);
                Ok(())
            }
        }
    }

    /// Allocate `ddx` at the value's shape unless it already is.
    pub fn resize_ddx(&mut self) -> Result<()> {
        let shape = self.x.shape().clone();
        match &mut self.ddx {
            Some(ddx) => resize_buffer(ddx, &shape),
            None => {
                self.ddx = Some(Tensor::zeros(shape)?);
                Ok(())
            }
        }
    }

    pub fn zero_dx(&self) -> Result<()> {
        ops::clear(self.dx()?)
    }

    pub fn zero_ddx(&self) -> Result<()> {
        ops::clear(self.ddx()?)
    }

    /// Clear the value and whichever derivatives are allocated.
    pub fn zero_all(&self) -> Result<()> {
        ops::clear(&self.x)?;
        if self.dx.is_some() {
            self.zero_dx()?;
        }
        if self.ddx.is_some() {
            self.zero_ddx()?;
        }
        Ok(())
    }

    /// Allocate (if needed) and zero `dx`: the entry step of a bprop.
    pub fn prepare_dx(&mut self) -> Result<()> {
        self.resize_dx()?;
        self.zero_dx()
    }

    /// Allocate (if needed) and zero `ddx`: the entry step of a bbprop.
    pub fn prepare_ddx(&mut self) -> Result<()> {
        self.resize_ddx()?;
        self.zero_ddx()
    }

    /// Independent copy of the value and allocated derivatives.
    pub fn deep_copy(&self) -> Result<State<T>> {
        Ok(State {
            x: self.x.deep_copy()?,
            dx: self.dx.as_ref().map(|t| t.deep_copy()).transpose()?,
            ddx: self.ddx.as_ref().map(|t| t.deep_copy()).transpose()?,
        })
    }

    fn map_views(&self, f: impl Fn(&Tensor<T>) -> Result<Tensor<T>>) -> Result<State<T>> {
        Ok(State {
            x: f(&self.x)?,
            dx: self.dx.as_ref().map(&f).transpose()?,
            ddx: self.ddx.as_ref().map(&f).transpose()?,
        })
    }

    /// State whose views are slice `index` of axis `dim` of this one.
    pub fn select_state(&self, dim: usize, index: usize) -> Result<State<T>> {
        self.map_views(|t| t.select(dim, index))
    }

    /// State whose views are narrowed along `dim`.
    pub fn narrow_state(&self, dim: usize, len: usize, start: usize) -> Result<State<T>> {
        self.map_views(|t| t.narrow(dim, len, start))
    }
}

fn resize_buffer<T: Element>(buf: &mut Tensor<T>, shape: &Shape) -> Result<()> {
    if buf.shape() == shape {
        return Ok(());
    }
    if buf.rank() == shape.rank() && buf.is_contiguous() {
        buf.resize(shape.clone())
    } else {
        buf.reset(shape.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivatives_are_lazy() {
        let mut s = State::<f32>::new((2, 3)).unwrap();
        assert!(matches!(s.dx(), Err(Error::DerivativeNotAllocated { which: "dx" })));
        s.resize_dx().unwrap();
        assert_eq!(s.dx().unwrap().dims(), &[2, 3]);
        assert!(s.ddx().is_err());
    }

    #[test]
    fn test_resize_dx_idempotent() {
        let mut s = State::<f32>::new(4).unwrap();
        s.resize_dx().unwrap();
        ops::fill(s.dx().unwrap(), 3.0).unwrap();
        s.resize_dx().unwrap();
        assert_eq!(s.dx().unwrap().to_vec().unwrap(), vec![3.0; 4]);
        s.prepare_dx().unwrap();
        assert_eq!(s.dx().unwrap().to_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_resize_follows_derivatives() {
        let mut s = State::<f64>::new((2, 2)).unwrap();
        s.resize_dx().unwrap();
        assert!(s.resize((3, 3)).unwrap());
        assert_eq!(s.dx().unwrap().dims(), &[3, 3]);
        assert!(!s.resize((3, 3)).unwrap());
        assert!(s.resize(5).unwrap());
        assert_eq!(s.dx().unwrap().dims(), &[5]);
        assert!(!s.has_ddx());
    }

    #[test]
    fn test_stale_derivative_detected() {
        let x = Tensor::<f32>::zeros((2, 2)).unwrap();
        let mut s = State::from_tensor(x);
        s.resize_dx().unwrap();
        s.x.resize((1, 2)).unwrap();
        assert!(matches!(s.dx(), Err(Error::StaleDerivative { .. })));
        s.resize_dx().unwrap();
        assert_eq!(s.dx().unwrap().dims(), &[1, 2]);
    }

    #[test]
    fn test_deep_copy() {
        let mut a = State::<f64>::new(3).unwrap();
        ops::fill(a.x(), 1.0).unwrap();
        a.resize_dx().unwrap();
        ops::fill(a.dx().unwrap(), 2.0).unwrap();
        let b = a.deep_copy().unwrap();
        ops::fill(a.x(), -1.0).unwrap();
        ops::fill(a.dx().unwrap(), -2.0).unwrap();
        assert_eq!(b.x().to_vec().unwrap(), vec![1.0; 3]);
        assert_eq!(b.dx().unwrap().to_vec().unwrap(), vec![2.0; 3]);
        assert!(!b.has_ddx());
    }

    #[test]
    fn test_select_and_narrow_state_alias() {
        let mut s = State::<f32>::new((2, 4)).unwrap();
        s.resize_dx().unwrap();
        let row = s.select_state(0, 1).unwrap();
        ops::fill(row.dx().unwrap(), 1.0).unwrap();
        let part = s.narrow_state(1, 2, 2).unwrap();
        assert_eq!(part.dims(), &[2, 2]);
        assert_eq!(part.dx().unwrap().to_vec().unwrap(), vec![0.0, 0.0, 1.0, 1.0]);
    }
}
