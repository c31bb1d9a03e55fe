use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: the shape descriptor of a view (extents + strides + offset)
//
// The Layout decouples the *logical* shape of a view from how its data is
// arranged in the storage buffer. Every sub-view operation is a pure function
// from one Layout to another; storage is never touched.
//
// 1. **select(d, i)**: drop axis d, shift the offset by i * stride[d].
//
// 2. **narrow(d, len, start)**: shrink axis d to len, shift the offset by
//    start * stride[d]. Strides are unchanged.
//
// 3. **transpose(a, b)**: swap the (extent, stride) pairs of two axes.
//
// 4. **unfold(d, k, s)**: sliding windows of size k taken every s steps
//    along axis d. Axis d becomes the window count with stride
//    stride[d] * s, and a new trailing axis of extent k walks inside one
//    window with the original stride[d]. Windows overlap when s < k, so
//    the same storage element is reachable from several logical positions.
//    Correlation is a contraction over those trailing axes.
//
// Contiguity only looks at strides: a view whose strides are the row-major
// strides of its extents is contiguous wherever it starts in the buffer.

/// Layout describes how a view's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Offset into the storage buffer where this view's data starts.
    offset: usize,
}

impl Layout {
    /// Create a new contiguous layout for the given shape.
    /// Strides are computed as row-major (C-order).
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Contiguous layout starting at `offset` in the buffer.
    pub fn contiguous_at(shape: Shape, offset: usize) -> Self {
        let mut layout = Layout::contiguous(shape);
        layout.offset = offset;
        layout
    }

    /// Create a layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dim(&self, d: usize) -> Result<usize> {
        self.shape.dim(d)
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Strides match the row-major strides of the extents.
    pub fn is_contiguous(&self) -> bool {
        self.strides == self.shape.stride_contiguous()
    }

    /// One past the highest storage index this layout can reach.
    /// A view with no elements has a footprint equal to its offset.
    pub fn footprint(&self) -> usize {
        if self.elem_count() == 0 {
            return self.offset;
        }
        let span: usize = self
            .dims()
            .iter()
            .zip(self.strides.iter())
            .map(|(&d, &s)| (d - 1) * s)
            .sum();
        self.offset + span + 1
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        Ok(())
    }

    /// Remove axis `dim`, keeping slice `index`.
    ///
    /// Example: [4, 6] select(0, 2) → [6], offset += 2 * 6
    pub fn select(&self, dim: usize, index: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        let size = self.dims()[dim];
        if index >= size {
            return Err(Error::IndexOutOfRange { dim, index, size });
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.remove(dim);
        let stride = new_strides.remove(dim);
        Ok(Layout::new(
            Shape::new(new_dims),
            new_strides,
            self.offset + index * stride,
        ))
    }

    /// Transpose two dimensions.
    ///
    /// Example: [2, 3, 4] transpose(0, 2) → [4, 3, 2]
    ///          strides [12, 4, 1]         → [1, 4, 12]
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        self.check_dim(dim0.max(dim1))?;
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// Reorder all axes: axis `i` of the result is axis `perm[i]` of `self`.
    pub fn permute(&self, perm: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if perm.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: perm.len(),
            });
        }
        let mut seen = [false; crate::shape::MAX_RANK];
        for &p in perm {
            self.check_dim(p)?;
            if seen[p] {
                crate::bail!("permutation {:?} repeats axis {}", perm, p);
            }
            seen[p] = true;
        }
        let new_dims = perm.iter().map(|&p| self.dims()[p]).collect();
        let new_strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// Narrow along a dimension to `len` elements starting at `start`.
    ///
    /// Example: [4, 6] narrow(dim=1, len=3, start=2)
    /// → shape [4, 3], offset += 2 * stride[1]
    pub fn narrow(&self, dim: usize, len: usize, start: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        let dim_size = self.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut new_dims = self.dims().to_vec();
        new_dims[dim] = len;
        let new_offset = self.offset + start * self.strides[dim];
        Ok(Layout::new(
            Shape::new(new_dims),
            self.strides.clone(),
            new_offset,
        ))
    }

    /// Sliding windows of size `window` every `step` along `dim`.
    ///
    /// The windows must tile the axis exactly:
    /// `dim_size == step * (n - 1) + window` with `n = 1 + (dim_size - window) / step`.
    ///
    /// Example: [5] unfold(0, 3, 1) → [3, 3], strides [1, 1]
    pub fn unfold(&self, dim: usize, window: usize, step: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        let dim_size = self.dims()[dim];
        let err = Error::UnfoldOutOfBounds {
            dim,
            dim_size,
            window,
            step,
        };
        if window == 0 || step == 0 || window > dim_size {
            return Err(err);
        }
        let n = 1 + (dim_size - window) / step;
        if dim_size != step * (n - 1) + window {
            return Err(err);
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims[dim] = n;
        new_strides[dim] = self.strides[dim] * step;
        new_dims.push(window);
        new_strides.push(self.strides[dim]);
        let shape = Shape::new(new_dims);
        shape.check_rank()?;
        Ok(Layout::new(shape, new_strides, self.offset))
    }

    /// Compute the flat index into storage for a given multi-dimensional index.
    /// flat_index = offset + sum(index[i] * stride[i])
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Bounds-checked version of `flat_index`.
    pub fn checked_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        for (dim, (&i, &size)) in index.iter().zip(self.dims().iter()).enumerate() {
            if i >= size {
                return Err(Error::IndexOutOfRange {
                    dim,
                    index: i,
                    size,
                });
            }
        }
        Ok(self.flat_index(index))
    }

    /// Iterator over all flat indices of this layout, in row-major order.
    pub fn strided_indices(&self) -> crate::iter::StridedVisitor {
        crate::iter::StridedVisitor::new(self)
    }
}
