use std::fmt;

use crate::error::{Error, Result};
use crate::iter::{self, Looper};
use crate::layout::Layout;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Element;

// Tensor: a view over a shared storage buffer
//
// A Tensor is a (Layout, Storage) pair. Cloning a Tensor is cheap and gives
// an alias: both handles see the same elements. Every sub-view operation
// (select, narrow, transpose, permute, unfold, reshape) returns a new
// Tensor on the same storage with a new Layout. Nothing is copied unless
// `deep_copy` is called.
//
// Shape compatibility between views is always a question about extents,
// never about which buffer they live in.
//
// RESIZING:
//
// `resize` keeps the rank and only works on contiguous views. When the new
// extents fit in the buffer the layout is simply overwritten; otherwise the
// shared buffer grows in place (aliases keep working). Changing the rank
// goes through `reshape` (a new view) or `reset` (a fresh buffer).

/// An N-dimensional strided view over shared storage.
#[derive(Clone)]
pub struct Tensor<T: Element> {
    storage: Storage<T>,
    layout: Layout,
}

impl<T: Element> Tensor<T> {
    // Construction

    /// Zero-filled view with fresh storage.
    pub fn zeros(shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        shape.check_rank()?;
        let storage = Storage::zeros(shape.elem_count());
        Ok(Tensor {
            storage,
            layout: Layout::contiguous(shape),
        })
    }

    /// View filled with `value`.
    pub fn full(shape: impl Into<Shape>, value: T) -> Result<Self> {
        let shape = shape.into();
        shape.check_rank()?;
        let storage = Storage::from_vec(vec![value; shape.elem_count()]);
        Ok(Tensor {
            storage,
            layout: Layout::contiguous(shape),
        })
    }

    /// Row-major data laid out as `shape`.
    pub fn from_vec(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        shape.check_rank()?;
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Tensor {
            storage: Storage::from_vec(data),
            layout: Layout::contiguous(shape),
        })
    }

    pub fn from_slice(data: &[T], shape: impl Into<Shape>) -> Result<Self> {
        Tensor::from_vec(data.to_vec(), shape)
    }

    /// Rank-0 view holding one value.
    pub fn scalar(value: T) -> Self {
        Tensor {
            storage: Storage::from_vec(vec![value]),
            layout: Layout::contiguous(Shape::from(())),
        }
    }

    /// View an existing buffer through `layout`.
    /// The buffer grows if the layout reaches past its end.
    pub fn from_storage(storage: Storage<T>, layout: Layout) -> Result<Self> {
        layout.shape().check_rank()?;
        storage.grow(layout.footprint())?;
        Ok(Tensor { storage, layout })
    }

    /// Zero-filled view with fresh storage and the same extents.
    pub fn zeros_like(&self) -> Result<Self> {
        Tensor::zeros(self.shape().clone())
    }

    // Accessors

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn dim(&self, d: usize) -> Result<usize> {
        self.layout.dim(d)
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    pub fn offset(&self) -> usize {
        self.layout.offset()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn storage(&self) -> &Storage<T> {
        &self.storage
    }

    /// Both views reference the same buffer.
    pub fn same_storage(&self, other: &Tensor<T>) -> bool {
        self.storage.same(&other.storage)
    }

    /// Same rank and extents (storage is not compared).
    pub fn same_shape(&self, other: &Tensor<T>) -> bool {
        self.shape() == other.shape()
    }

    /// Fail with `ShapeMismatch` unless `other` has the same extents.
    pub fn check_same_shape(&self, other: &Tensor<T>) -> Result<()> {
        if !self.same_shape(other) {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: other.shape().clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn require_contiguous(&self, op: &'static str) -> Result<()> {
        if !self.is_contiguous() {
            return Err(Error::NotContiguous {
                op,
                shape: self.shape().clone(),
                strides: self.strides().to_vec(),
            });
        }
        Ok(())
    }

    // Element access

    /// Bounds-checked read.
    pub fn get(&self, index: &[usize]) -> Result<T> {
        let i = self.layout.checked_index(index)?;
        Ok(self.storage.read()?[i])
    }

    /// Bounds-checked write. Visible through every alias.
    pub fn set(&self, index: &[usize], value: T) -> Result<()> {
        let i = self.layout.checked_index(index)?;
        self.storage.write()?[i] = value;
        Ok(())
    }

    /// Value of a single-element view of any rank.
    pub fn to_scalar(&self) -> Result<T> {
        if self.elem_count() != 1 {
            crate::bail!("to_scalar on a view of shape {}", self.shape());
        }
        let data = self.storage.read()?;
        let mut v = T::zero();
        iter::for_each1(&self.layout, |i| v = data[i]);
        Ok(v)
    }

    /// Elements in row-major order.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let data = self.storage.read()?;
        let mut out = Vec::with_capacity(self.elem_count());
        iter::for_each1(&self.layout, |i| out.push(data[i]));
        Ok(out)
    }

    // Resizing

    /// Change the extents in place, keeping the rank.
    ///
    /// A no-op when the extents are unchanged. Grows the shared buffer when
    /// the new extents do not fit.
    pub fn resize(&mut self, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        if &shape == self.shape() {
            return Ok(());
        }
        if shape.rank() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: shape.rank(),
            });
        }
        self.require_contiguous("resize")?;
        let layout = Layout::contiguous_at(shape, self.offset());
        self.storage.grow(layout.footprint())?;
        self.layout = layout;
        Ok(())
    }

    /// Resize to the extents of `other`.
    pub fn resize_as(&mut self, other: &Tensor<T>) -> Result<()> {
        self.resize(other.shape().clone())
    }

    /// Replace this handle with a fresh zeroed buffer of any rank.
    /// Other aliases of the old buffer are unaffected.
    pub fn reset(&mut self, shape: impl Into<Shape>) -> Result<()> {
        *self = Tensor::zeros(shape)?;
        Ok(())
    }

    /// View the same contiguous data with different extents.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor<T>> {
        let shape = shape.into();
        shape.check_rank()?;
        self.require_contiguous("reshape")?;
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: self.elem_count(),
                shape,
            });
        }
        Ok(Tensor {
            storage: self.storage.clone(),
            layout: Layout::contiguous_at(shape, self.offset()),
        })
    }

    /// 1-D view of contiguous data.
    pub fn flatten(&self) -> Result<Tensor<T>> {
        self.reshape(self.elem_count())
    }

    // Sub-views

    fn with_layout(&self, layout: Layout) -> Tensor<T> {
        Tensor {
            storage: self.storage.clone(),
            layout,
        }
    }

    /// Slice `index` of axis `dim`; the result has one axis less.
    pub fn select(&self, dim: usize, index: usize) -> Result<Tensor<T>> {
        Ok(self.with_layout(self.layout.select(dim, index)?))
    }

    /// `len` elements of axis `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, len: usize, start: usize) -> Result<Tensor<T>> {
        Ok(self.with_layout(self.layout.narrow(dim, len, start)?))
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor<T>> {
        Ok(self.with_layout(self.layout.transpose(dim0, dim1)?))
    }

    pub fn permute(&self, perm: &[usize]) -> Result<Tensor<T>> {
        Ok(self.with_layout(self.layout.permute(perm)?))
    }

    /// Sliding windows along `dim` as a new trailing axis.
    pub fn unfold(&self, dim: usize, window: usize, step: usize) -> Result<Tensor<T>> {
        Ok(self.with_layout(self.layout.unfold(dim, window, step)?))
    }

    /// Iterate the slices of axis `dim`.
    pub fn looper(&self, dim: usize) -> Result<Looper<T>> {
        let len = self.dim(dim)?;
        Ok(Looper::new(self.clone(), dim, len))
    }

    /// Iterate the slices of the first axis.
    pub fn bloop(&self) -> Result<Looper<T>> {
        self.looper(0)
    }

    /// Iterate the slices of the last axis.
    pub fn eloop(&self) -> Result<Looper<T>> {
        if self.rank() == 0 {
            return Err(Error::DimOutOfRange { dim: 0, rank: 0 });
        }
        self.looper(self.rank() - 1)
    }

    /// Independent contiguous copy with fresh storage.
    pub fn deep_copy(&self) -> Result<Tensor<T>> {
        Tensor::from_vec(self.to_vec()?, self.shape().clone())
    }
}

impl<T: Element> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, strides={:?}, offset={}, dtype={})",
            self.shape(),
            self.strides(),
            self.offset(),
            T::DTYPE
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(shape: impl Into<Shape>) -> Tensor<f32> {
        let shape = shape.into();
        let data = (0..shape.elem_count()).map(|i| i as f32).collect();
        Tensor::from_vec(data, shape).unwrap()
    }

    #[test]
    fn test_get_set_alias() {
        let t = arange((2, 3));
        let alias = t.transpose(0, 1).unwrap();
        assert_eq!(alias.get(&[2, 1]).unwrap(), 5.0);
        alias.set(&[2, 1], 42.0).unwrap();
        assert_eq!(t.get(&[1, 2]).unwrap(), 42.0);
        assert!(matches!(t.get(&[2, 0]), Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_resize_in_place() {
        let mut t = arange((4, 5));
        let before = t.storage().data_ptr().unwrap();
        t.resize((2, 5)).unwrap();
        assert_eq!(t.to_vec().unwrap(), (0..10).map(|i| i as f32).collect::<Vec<_>>());
        t.resize((2, 5)).unwrap();
        assert_eq!(t.storage().data_ptr().unwrap(), before);
        assert_eq!(t.storage().len().unwrap(), 20);
    }

    #[test]
    fn test_resize_grows_shared_buffer() {
        let mut t = arange(3);
        let alias = t.clone();
        t.resize(6).unwrap();
        assert_eq!(t.storage().len().unwrap(), 6);
        assert!(t.same_storage(&alias));
        assert_eq!(alias.to_vec().unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_resize_rules() {
        let mut t = arange((2, 3));
        assert!(matches!(t.resize(6), Err(Error::RankMismatch { .. })));
        let mut tt = t.transpose(0, 1).unwrap();
        assert!(matches!(tt.resize((3, 3)), Err(Error::NotContiguous { .. })));
        t.reset(6).unwrap();
        assert_eq!(t.dims(), &[6]);
    }

    #[test]
    fn test_select_narrow_views() {
        let t = arange((3, 4));
        let row = t.select(0, 1).unwrap();
        assert_eq!(row.to_vec().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
        let col = t.select(1, 2).unwrap();
        assert_eq!(col.to_vec().unwrap(), vec![2.0, 6.0, 10.0]);
        let block = t.narrow(0, 2, 1).unwrap().narrow(1, 2, 1).unwrap();
        assert_eq!(block.to_vec().unwrap(), vec![5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn test_unfold_2d_windows() {
        let t = arange((3, 3));
        let u = t.unfold(0, 2, 1).unwrap().unfold(1, 2, 1).unwrap();
        assert_eq!(u.dims(), &[2, 2, 2, 2]);
        let w = u.select(0, 1).unwrap().select(0, 1).unwrap();
        assert_eq!(w.to_vec().unwrap(), vec![4.0, 5.0, 7.0, 8.0]);
    }

    #[test]
    fn test_select_matches_unfold_narrow() {
        // select(0, i) equals window i of a size-1 unfold and a narrowed
        // deep copy, element for element.
        let t = arange((4, 3));
        for i in 0..4 {
            let selected = t.select(0, i).unwrap().to_vec().unwrap();
            let via_unfold = t
                .unfold(0, 1, 1)
                .unwrap()
                .select(0, i)
                .unwrap()
                .select(1, 0)
                .unwrap();
            let via_narrow = t.narrow(0, 1, i).unwrap().deep_copy().unwrap();
            assert_eq!(via_unfold.to_vec().unwrap(), selected);
            assert_eq!(via_narrow.to_vec().unwrap(), selected);
        }
    }

    #[test]
    fn test_deep_copy_breaks_alias() {
        let t = arange((2, 2));
        let c = t.transpose(0, 1).unwrap().deep_copy().unwrap();
        assert!(c.is_contiguous());
        assert!(!c.same_storage(&t));
        t.set(&[0, 1], -1.0).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![0.0, 2.0, 1.0, 3.0]);
    }

    #[test]
    fn test_looper() {
        let t = arange((3, 2));
        let rows: Vec<Vec<f32>> = t.bloop().unwrap().map(|r| r.to_vec().unwrap()).collect();
        assert_eq!(rows, vec![vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]]);
        let cols: Vec<Vec<f32>> = t.eloop().unwrap().map(|c| c.to_vec().unwrap()).collect();
        assert_eq!(cols, vec![vec![0.0, 2.0, 4.0], vec![1.0, 3.0, 5.0]]);
        assert!(Tensor::scalar(1.0f32).eloop().is_err());
    }

    #[test]
    fn test_rank_limit() {
        assert!(Tensor::<f32>::zeros(vec![1; 9]).is_err());
        let t = Tensor::<f32>::zeros(vec![2; 8]).unwrap();
        assert!(t.unfold(0, 1, 1).is_err());
    }

    #[test]
    fn test_from_vec_count_mismatch() {
        assert!(matches!(
            Tensor::from_vec(vec![1.0f32; 5], (2, 3)),
            Err(Error::ElementCountMismatch { expected: 6, got: 5, .. })
        ));
    }
}
