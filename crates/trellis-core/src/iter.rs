// Iteration engine: visiting the elements of a view in row-major order
//
// Two visitors produce the storage index of every element of a Layout:
//
//   ContiguousVisitor: the view's strides are row-major, so consecutive
//     elements are consecutive in storage. The cursor is bumped by one until
//     it reaches the end bound.
//
//   StridedVisitor: classic N-dimensional odometer. One counter per axis;
//     advancing bumps the innermost counter and moves the cursor by that
//     axis' stride. When a counter reaches its extent it resets to zero,
//     the cursor is rewound by extent * stride, and the carry moves one
//     axis outward.
//
// Both yield indices in the same order (outermost axis slowest), so any
// operator gives bit-identical results whichever path each operand takes.
//
// The `for_each*` helpers pick a visitor per operand at call time. With n
// operands there are 2^n combinations; each one is a separate monomorphized
// loop, so the all-contiguous case compiles down to plain counting.

use crate::layout::Layout;
use crate::shape::MAX_RANK;
use crate::tensor::Tensor;
use crate::Element;

/// A visitor over storage indices that can skip ahead.
pub trait Visit: Iterator<Item = usize> {
    /// Skip the next `n` elements. Jumping past the end exhausts the visitor.
    fn jump(&mut self, n: usize);
}

/// Visitor for contiguous layouts: a cursor and an end bound.
#[derive(Debug, Clone)]
pub struct ContiguousVisitor {
    cursor: usize,
    end: usize,
}

impl ContiguousVisitor {
    pub fn new(layout: &Layout) -> Self {
        ContiguousVisitor {
            cursor: layout.offset(),
            end: layout.offset() + layout.elem_count(),
        }
    }
}

impl Iterator for ContiguousVisitor {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.cursor < self.end {
            let c = self.cursor;
            self.cursor += 1;
            Some(c)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end - self.cursor;
        (n, Some(n))
    }
}

impl ExactSizeIterator for ContiguousVisitor {}

impl Visit for ContiguousVisitor {
    fn jump(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.end);
    }
}

/// Visitor for arbitrary strided layouts (odometer walk).
#[derive(Debug, Clone)]
pub struct StridedVisitor {
    cursor: usize,
    counters: [usize; MAX_RANK],
    dims: [usize; MAX_RANK],
    strides: [usize; MAX_RANK],
    rank: usize,
    remaining: usize,
}

impl StridedVisitor {
    pub fn new(layout: &Layout) -> Self {
        let rank = layout.rank();
        let mut dims = [0; MAX_RANK];
        let mut strides = [0; MAX_RANK];
        dims[..rank].copy_from_slice(layout.dims());
        strides[..rank].copy_from_slice(layout.strides());
        StridedVisitor {
            cursor: layout.offset(),
            counters: [0; MAX_RANK],
            dims,
            strides,
            rank,
            remaining: layout.elem_count(),
        }
    }

    /// Current per-axis position of the next element to be yielded.
    pub fn counters(&self) -> &[usize] {
        &self.counters[..self.rank]
    }

    #[inline]
    fn advance(&mut self) {
        for i in (0..self.rank).rev() {
            self.counters[i] += 1;
            self.cursor += self.strides[i];
            if self.counters[i] < self.dims[i] {
                return;
            }
            self.cursor -= self.strides[i] * self.dims[i];
            self.counters[i] = 0;
        }
    }
}

impl Iterator for StridedVisitor {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let c = self.cursor;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.advance();
        }
        Some(c)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedVisitor {}

impl Visit for StridedVisitor {
    fn jump(&mut self, n: usize) {
        if n >= self.remaining {
            self.remaining = 0;
            return;
        }
        self.remaining -= n;
        let mut carry = n;
        for i in (0..self.rank).rev() {
            if carry == 0 {
                break;
            }
            let total = self.counters[i] + carry;
            let next = total % self.dims[i];
            carry = total / self.dims[i];
            self.cursor = self.cursor - self.counters[i] * self.strides[i] + next * self.strides[i];
            self.counters[i] = next;
        }
    }
}

// Picks the visitor for one layout and evaluates `$body` with it bound to `$v`.
macro_rules! with_visitor {
    ($layout:expr, $v:ident => $body:expr) => {
        if $layout.is_contiguous() {
            let $v = ContiguousVisitor::new($layout);
            $body
        } else {
            let $v = StridedVisitor::new($layout);
            $body
        }
    };
}

/// Call `f` with the storage index of every element of `a`.
pub fn for_each1(a: &Layout, mut f: impl FnMut(usize)) {
    with_visitor!(a, va => va.for_each(&mut f))
}

/// Walk two layouts in lockstep. Callers check that element counts match;
/// iteration stops at the shorter one.
pub fn for_each2(a: &Layout, b: &Layout, mut f: impl FnMut(usize, usize)) {
    with_visitor!(a, va => with_visitor!(b, vb => {
        va.zip(vb).for_each(|(i, j)| f(i, j))
    }))
}

/// Walk three layouts in lockstep.
pub fn for_each3(a: &Layout, b: &Layout, c: &Layout, mut f: impl FnMut(usize, usize, usize)) {
    with_visitor!(a, va => with_visitor!(b, vb => with_visitor!(c, vc => {
        va.zip(vb).zip(vc).for_each(|((i, j), k)| f(i, j, k))
    })))
}

// Looper: iterate one axis, yielding a reduced-rank view per step
//
// `Looper` is what per-feature-map code is written with: loop over axis 0 of
// a [features, rows, cols] view and get a [rows, cols] view per feature, all
// aliasing the original storage. It ends when the axis is exhausted and
// cannot be restarted.

/// Iterator over the slices of a view along one axis.
pub struct Looper<T: Element> {
    source: Tensor<T>,
    axis: usize,
    index: usize,
    len: usize,
}

impl<T: Element> Looper<T> {
    pub(crate) fn new(source: Tensor<T>, axis: usize, len: usize) -> Self {
        Looper {
            source,
            axis,
            index: 0,
            len,
        }
    }
}

impl<T: Element> Iterator for Looper<T> {
    type Item = Tensor<T>;

    fn next(&mut self) -> Option<Tensor<T>> {
        if self.index >= self.len {
            return None;
        }
        let slice = self.source.select(self.axis, self.index).ok()?;
        self.index += 1;
        Some(slice)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len - self.index;
        (n, Some(n))
    }
}

impl<T: Element> ExactSizeIterator for Looper<T> {}
