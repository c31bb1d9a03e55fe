use std::fmt;

use crate::error::{Error, Result};

// Shape: per-dimension extents of a view
//
// A Shape only lists extents. How those extents map onto a storage buffer
// (strides, base offset) lives in `Layout`. Modules manipulate shapes a lot
// when sizing outputs: replace the feature axis, insert a thickness axis,
// grow spatial axes by padding, and so on.

/// Highest rank a view may have.
pub const MAX_RANK: usize = 8;

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element, any zero extent gives 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Row-major strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Copy of this shape with dimension `d` replaced by `size`.
    pub fn with_dim(&self, d: usize, size: usize) -> Result<Shape> {
        self.dim(d)?;
        let mut dims = self.0.clone();
        dims[d] = size;
        Ok(Shape(dims))
    }

    /// Copy of this shape with a new dimension of `size` inserted before `d`.
    pub fn insert_dim(&self, d: usize, size: usize) -> Result<Shape> {
        if d > self.rank() {
            return Err(Error::DimOutOfRange {
                dim: d,
                rank: self.rank(),
            });
        }
        let mut dims = self.0.clone();
        dims.insert(d, size);
        Ok(Shape(dims))
    }

    /// Copy of this shape without dimension `d`.
    pub fn remove_dim(&self, d: usize) -> Result<Shape> {
        self.dim(d)?;
        let mut dims = self.0.clone();
        dims.remove(d);
        Ok(Shape(dims))
    }

    /// Fail with `RankTooLarge` above `MAX_RANK`.
    pub fn check_rank(&self) -> Result<()> {
        if self.rank() > MAX_RANK {
            return Err(Error::RankTooLarge {
                rank: self.rank(),
                max: MAX_RANK,
            });
        }
        Ok(())
    }

    /// Largest extent, 0 for a scalar.
    pub fn max_dim(&self) -> usize {
        self.0.iter().copied().max().unwrap_or(0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert_eq!(s.stride_contiguous(), Vec::<usize>::new());
    }

    #[test]
    fn test_empty_extent() {
        assert_eq!(Shape::from((3, 0)).elem_count(), 0);
    }

    #[test]
    fn test_3d_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(s.elem_count(), 24);
    }

    #[test]
    fn test_dim_edits() {
        let s = Shape::from((5, 10, 10));
        assert_eq!(s.with_dim(0, 7).unwrap().dims(), &[7, 10, 10]);
        assert_eq!(s.insert_dim(0, 2).unwrap().dims(), &[2, 5, 10, 10]);
        assert_eq!(s.insert_dim(3, 2).unwrap().dims(), &[5, 10, 10, 2]);
        assert_eq!(s.remove_dim(1).unwrap().dims(), &[5, 10]);
        assert!(s.with_dim(3, 1).is_err());
        assert!(s.insert_dim(4, 1).is_err());
    }

    #[test]
    fn test_rank_limit() {
        assert!(Shape::from(vec![1; MAX_RANK]).check_rank().is_ok());
        assert!(Shape::from(vec![1; MAX_RANK + 1]).check_rank().is_err());
    }

    #[test]
    fn test_display() {
        let s = Shape::from((3, 4));
        assert_eq!(format!("{}", s), "[3, 4]");
    }
}
