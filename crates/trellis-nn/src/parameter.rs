// Parameter: one flat buffer holding every learnable tensor of a network
//
// Modules given a `Parameter` carve their weights out of it instead of
// allocating private storage. Each allocation is a contiguous view at the
// current end of the buffer; the buffer then grows in place, so views handed
// out earlier stay valid. A trainer can then update, zero, save or load the
// whole network as three flat vectors (value, dx, ddx).

use trellis_core::{ops, Error, Layout, Result, Shape, Storage, Tensor};

use crate::state::State;
use crate::Element;

/// Growable flat buffer of parameters with companion derivative buffers.
#[derive(Debug)]
pub struct Parameter<T: Element> {
    x: Storage<T>,
    dx: Storage<T>,
    ddx: Storage<T>,
    len: usize,
}

impl<T: Element> Default for Parameter<T> {
    fn default() -> Self {
        Parameter::new()
    }
}

impl<T: Element> Parameter<T> {
    pub fn new() -> Self {
        Parameter {
            x: Storage::zeros(0),
            dx: Storage::zeros(0),
            ddx: Storage::zeros(0),
            len: 0,
        }
    }

    /// Number of parameters allocated so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Carve a new state of `shape` out of the buffer.
    pub fn allocate(&mut self, shape: impl Into<Shape>) -> Result<State<T>> {
        let layout = Layout::contiguous_at(shape.into(), self.len);
        let x = Tensor::from_storage(self.x.clone(), layout.clone())?;
        let dx = Tensor::from_storage(self.dx.clone(), layout.clone())?;
        let ddx = Tensor::from_storage(self.ddx.clone(), layout.clone())?;
        self.len += layout.elem_count();
        Ok(State::from_parts(x, dx, ddx))
    }

    fn flat(&self, storage: &Storage<T>) -> Result<Tensor<T>> {
        Tensor::from_storage(storage.clone(), Layout::contiguous(Shape::from(self.len)))
    }

    /// Every parameter value as one 1-D view.
    pub fn x(&self) -> Result<Tensor<T>> {
        self.flat(&self.x)
    }

    pub fn dx(&self) -> Result<Tensor<T>> {
        self.flat(&self.dx)
    }

    pub fn ddx(&self) -> Result<Tensor<T>> {
        self.flat(&self.ddx)
    }

    pub fn zero_dx(&self) -> Result<()> {
        ops::clear(&self.dx()?)
    }

    pub fn zero_ddx(&self) -> Result<()> {
        ops::clear(&self.ddx()?)
    }

    /// Overwrite all values from a flat weight vector of exactly `len()`.
    pub fn load_x(&self, weights: &[T]) -> Result<()> {
        if weights.len() != self.len {
            return Err(Error::ElementCountMismatch {
                shape: Shape::from(self.len),
                expected: self.len,
                got: weights.len(),
            });
        }
        let src = Tensor::from_slice(weights, self.len)?;
        ops::copy(&src, &self.x()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_alias_flat_buffer() {
        let mut p = Parameter::<f32>::new();
        let a = p.allocate((2, 2)).unwrap();
        let b = p.allocate(3).unwrap();
        assert_eq!(p.len(), 7);
        assert_eq!(b.x().offset(), 4);
        ops::fill(a.x(), 1.0).unwrap();
        ops::fill(b.x(), 2.0).unwrap();
        assert_eq!(
            p.x().unwrap().to_vec().unwrap(),
            vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0]
        );
        ops::fill(&p.dx().unwrap(), 5.0).unwrap();
        assert_eq!(a.dx().unwrap().to_vec().unwrap(), vec![5.0; 4]);
        p.zero_dx().unwrap();
        assert_eq!(b.dx().unwrap().to_vec().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_load_x() {
        let mut p = Parameter::<f64>::new();
        let a = p.allocate(2).unwrap();
        p.load_x(&[0.5, -0.5]).unwrap();
        assert_eq!(a.x().to_vec().unwrap(), vec![0.5, -0.5]);
        assert!(p.load_x(&[1.0]).is_err());
    }
}
