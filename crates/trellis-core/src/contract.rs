// Contractions between 1/2/4-dimensional views
//
// These are the kernels behind the linear and convolution modules. All of
// them accumulate into their destination (`out += ...`), take arbitrary
// strides, and check extents up front.
//
// Convolution is written entirely in terms of unfolded views:
//
//   m4dotm2acc(windows [Oi, Oj, ki, kj], kernel [ki, kj], out [Oi, Oj])
//       correlation: each output pixel is the dot product of its window
//       with the kernel
//   m2extm2acc(grad [Oi, Oj], kernel [ki, kj], windows [Oi, Oj, ki, kj])
//       the input gradient: every window receives grad * kernel; windows
//       overlap in storage, so the accumulation order is the row-major
//       order of the destination
//
// The `squ` variants square one operand first. They are what the
// second-order (diagonal Gauss-Newton) passes use.

use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::storage::Sources;
use crate::tensor::Tensor;
use crate::Element;

fn expect_dims<T: Element>(t: &Tensor<T>, expected: &[usize]) -> Result<()> {
    if t.rank() != expected.len() {
        return Err(Error::RankMismatch {
            expected: expected.len(),
            got: t.rank(),
        });
    }
    if t.dims() != expected {
        return Err(Error::ShapeMismatch {
            expected: Shape::from(expected),
            got: t.shape().clone(),
        });
    }
    Ok(())
}

fn expect_rank<T: Element>(t: &Tensor<T>, rank: usize) -> Result<()> {
    if t.rank() != rank {
        return Err(Error::RankMismatch {
            expected: rank,
            got: t.rank(),
        });
    }
    Ok(())
}

#[inline]
fn sq<T: Element>(x: T, square: bool) -> T {
    if square {
        x * x
    } else {
        x
    }
}

fn matmul_acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>, square_a: bool) -> Result<()> {
    expect_rank(a, 2)?;
    let (ni, nk) = (a.dims()[0], a.dims()[1]);
    expect_rank(b, 2)?;
    let nj = b.dims()[1];
    expect_dims(b, &[nk, nj])?;
    expect_dims(out, &[ni, nj])?;

    let (ao, a0, a1) = (a.offset(), a.strides()[0], a.strides()[1]);
    let (bo, b0, b1) = (b.offset(), b.strides()[0], b.strides()[1]);
    let (oo, o0, o1) = (out.offset(), out.strides()[0], out.strides()[1]);

    let mut data = out.storage().write()?;
    let srcs = Sources::lock(Some(out.storage()), &[a.storage(), b.storage()])?;
    for i in 0..ni {
        for j in 0..nj {
            let mut acc = T::zero();
            for k in 0..nk {
                let x = sq(srcs.get(0, &data, ao + i * a0 + k * a1), square_a);
                acc = acc + x * srcs.get(1, &data, bo + k * b0 + j * b1);
            }
            let o = oo + i * o0 + j * o1;
            data[o] = data[o] + acc;
        }
    }
    Ok(())
}

/// out[i, j] += sum_k a[i, k] * b[k, j]
pub fn m2dotm2acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    matmul_acc(a, b, out, false)
}

/// out[i, j] += sum_k a[i, k]^2 * b[k, j]
pub fn m2squdotm2acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    matmul_acc(a, b, out, true)
}

fn window_dot_acc<T: Element>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    out: &Tensor<T>,
    square_a: bool,
) -> Result<()> {
    expect_rank(a, 4)?;
    let d = a.dims();
    let (ni, nj, nk, nl) = (d[0], d[1], d[2], d[3]);
    expect_dims(b, &[nk, nl])?;
    expect_dims(out, &[ni, nj])?;

    let (ao, s) = (a.offset(), a.strides());
    let (a0, a1, a2, a3) = (s[0], s[1], s[2], s[3]);
    let (bo, b0, b1) = (b.offset(), b.strides()[0], b.strides()[1]);
    let (oo, o0, o1) = (out.offset(), out.strides()[0], out.strides()[1]);

    let mut data = out.storage().write()?;
    let srcs = Sources::lock(Some(out.storage()), &[a.storage(), b.storage()])?;
    for i in 0..ni {
        for j in 0..nj {
            let base = ao + i * a0 + j * a1;
            let mut acc = T::zero();
            for k in 0..nk {
                for l in 0..nl {
                    let x = sq(srcs.get(0, &data, base + k * a2 + l * a3), square_a);
                    acc = acc + x * srcs.get(1, &data, bo + k * b0 + l * b1);
                }
            }
            let o = oo + i * o0 + j * o1;
            data[o] = data[o] + acc;
        }
    }
    Ok(())
}

/// out[i, j] += sum_{k,l} a[i, j, k, l] * b[k, l]
pub fn m4dotm2acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    window_dot_acc(a, b, out, false)
}

/// out[i, j] += sum_{k,l} a[i, j, k, l]^2 * b[k, l]
pub fn m4squdotm2acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    window_dot_acc(a, b, out, true)
}

fn outer_acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>, square_b: bool) -> Result<()> {
    expect_rank(a, 2)?;
    expect_rank(b, 2)?;
    let (ni, nj) = (a.dims()[0], a.dims()[1]);
    let (nk, nl) = (b.dims()[0], b.dims()[1]);
    expect_dims(out, &[ni, nj, nk, nl])?;

    let (ao, a0, a1) = (a.offset(), a.strides()[0], a.strides()[1]);
    let (bo, b0, b1) = (b.offset(), b.strides()[0], b.strides()[1]);
    let (oo, s) = (out.offset(), out.strides());
    let (o0, o1, o2, o3) = (s[0], s[1], s[2], s[3]);

    let mut data = out.storage().write()?;
    let srcs = Sources::lock(Some(out.storage()), &[a.storage(), b.storage()])?;
    for i in 0..ni {
        for j in 0..nj {
            let x = srcs.get(0, &data, ao + i * a0 + j * a1);
            let base = oo + i * o0 + j * o1;
            for k in 0..nk {
                for l in 0..nl {
                    let y = sq(srcs.get(1, &data, bo + k * b0 + l * b1), square_b);
                    let o = base + k * o2 + l * o3;
                    data[o] = data[o] + x * y;
                }
            }
        }
    }
    Ok(())
}

/// out[i, j, k, l] += a[i, j] * b[k, l]
pub fn m2extm2acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    outer_acc(a, b, out, false)
}

/// out[i, j, k, l] += a[i, j] * b[k, l]^2
pub fn m2squextm2acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    outer_acc(a, b, out, true)
}

/// out[i * si + u, j * sj + v] += a[i, j] for every u < si, v < sj.
///
/// The adjoint of summing non-overlapping si x sj blocks.
pub fn m2oversampleacc<T: Element>(a: &Tensor<T>, si: usize, sj: usize, out: &Tensor<T>) -> Result<()> {
    expect_rank(a, 2)?;
    let (ni, nj) = (a.dims()[0], a.dims()[1]);
    expect_dims(out, &[ni * si, nj * sj])?;
    let (ao, a0, a1) = (a.offset(), a.strides()[0], a.strides()[1]);
    let (oo, o0, o1) = (out.offset(), out.strides()[0], out.strides()[1]);

    let mut data = out.storage().write()?;
    let srcs = Sources::lock(Some(out.storage()), &[a.storage()])?;
    for i in 0..ni {
        for j in 0..nj {
            let x = srcs.get(0, &data, ao + i * a0 + j * a1);
            for u in 0..si {
                for v in 0..sj {
                    let o = oo + (i * si + u) * o0 + (j * sj + v) * o1;
                    data[o] = data[o] + x;
                }
            }
        }
    }
    Ok(())
}
