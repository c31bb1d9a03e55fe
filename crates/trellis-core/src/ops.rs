// Elementwise operators and reductions
//
// Every operator here walks its operands with the iteration engine, so any
// mix of contiguous and strided views works. Operands only need the same
// element count; their shapes may differ (a [6] view can be added into a
// [2, 3] view). Elements are paired in row-major order.
//
// Naming follows one convention:
//   op(a, b, out)    out = a op b
//   op_acc(a, dst)   dst += a (accumulate into an existing buffer)
//
// The `apply*` functions are the building blocks; modules use them directly
// for closed-form derivative formulas that have no named operator.

use crate::error::{Error, Result};
use crate::iter;
use crate::storage::Sources;
use crate::tensor::Tensor;
use crate::Element;

fn check_count<T: Element>(a: &Tensor<T>, b: &Tensor<T>) -> Result<()> {
    if a.elem_count() != b.elem_count() {
        return Err(Error::ElementCountMismatch {
            shape: b.shape().clone(),
            expected: a.elem_count(),
            got: b.elem_count(),
        });
    }
    Ok(())
}

// Building blocks

/// Update every element of `dst` in place.
pub fn apply1<T: Element>(dst: &Tensor<T>, mut f: impl FnMut(&mut T)) -> Result<()> {
    let mut data = dst.storage().write()?;
    iter::for_each1(dst.layout(), |i| f(&mut data[i]));
    Ok(())
}

/// `f(src[k], &mut dst[k])` for every element pair.
pub fn apply2<T: Element>(
    src: &Tensor<T>,
    dst: &Tensor<T>,
    mut f: impl FnMut(T, &mut T),
) -> Result<()> {
    check_count(src, dst)?;
    let mut data = dst.storage().write()?;
    let srcs = Sources::lock(Some(dst.storage()), &[src.storage()])?;
    iter::for_each2(src.layout(), dst.layout(), |i, o| {
        let x = srcs.get(0, &data, i);
        f(x, &mut data[o]);
    });
    Ok(())
}

/// `f(a[k], b[k], &mut dst[k])` for every element triple.
pub fn apply3<T: Element>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    dst: &Tensor<T>,
    mut f: impl FnMut(T, T, &mut T),
) -> Result<()> {
    check_count(a, b)?;
    check_count(a, dst)?;
    let mut data = dst.storage().write()?;
    let srcs = Sources::lock(Some(dst.storage()), &[a.storage(), b.storage()])?;
    iter::for_each3(a.layout(), b.layout(), dst.layout(), |i, j, o| {
        let x = srcs.get(0, &data, i);
        let y = srcs.get(1, &data, j);
        f(x, y, &mut data[o]);
    });
    Ok(())
}

/// Fold over one view.
pub fn fold1<T: Element, A>(a: &Tensor<T>, init: A, mut f: impl FnMut(A, T) -> A) -> Result<A> {
    let data = a.storage().read()?;
    let mut acc = Some(init);
    iter::for_each1(a.layout(), |i| {
        acc = acc.take().map(|v| f(v, data[i]));
    });
    acc.ok_or_else(|| Error::msg("fold lost its accumulator"))
}

/// Fold over two views in lockstep.
pub fn fold2<T: Element, A>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    init: A,
    mut f: impl FnMut(A, T, T) -> A,
) -> Result<A> {
    check_count(a, b)?;
    let srcs = Sources::lock(None, &[a.storage(), b.storage()])?;
    let mut acc = Some(init);
    iter::for_each2(a.layout(), b.layout(), |i, j| {
        let x = srcs.get(0, &[], i);
        let y = srcs.get(1, &[], j);
        acc = acc.take().map(|v| f(v, x, y));
    });
    acc.ok_or_else(|| Error::msg("fold lost its accumulator"))
}

// Filling and copying

/// Set every element to zero.
pub fn clear<T: Element>(dst: &Tensor<T>) -> Result<()> {
    apply1(dst, |d| *d = T::zero())
}

pub fn fill<T: Element>(dst: &Tensor<T>, value: T) -> Result<()> {
    apply1(dst, |d| *d = value)
}

/// dst = src
pub fn copy<T: Element>(src: &Tensor<T>, dst: &Tensor<T>) -> Result<()> {
    apply2(src, dst, |x, d| *d = x)
}

// Binary arithmetic

/// out = a + b
pub fn add<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    apply3(a, b, out, |x, y, o| *o = x + y)
}

/// out = a - b
pub fn sub<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    apply3(a, b, out, |x, y, o| *o = x - y)
}

/// out = a * b (elementwise)
pub fn mul<T: Element>(a: &Tensor<T>, b: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    apply3(a, b, out, |x, y, o| *o = x * y)
}

/// dst += src
pub fn add_acc<T: Element>(src: &Tensor<T>, dst: &Tensor<T>) -> Result<()> {
    apply2(src, dst, |x, d| *d = *d + x)
}

/// dst -= src
pub fn sub_acc<T: Element>(src: &Tensor<T>, dst: &Tensor<T>) -> Result<()> {
    apply2(src, dst, |x, d| *d = *d - x)
}

/// dst += a * b
pub fn mul_acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, dst: &Tensor<T>) -> Result<()> {
    apply3(a, b, dst, |x, y, d| *d = *d + x * y)
}

/// dst += a * b * b
pub fn sqr_mul_acc<T: Element>(a: &Tensor<T>, b: &Tensor<T>, dst: &Tensor<T>) -> Result<()> {
    apply3(a, b, dst, |x, y, d| *d = *d + x * y * y)
}

// Scalar arithmetic

/// out = a * c
pub fn dotc<T: Element>(a: &Tensor<T>, c: T, out: &Tensor<T>) -> Result<()> {
    apply2(a, out, |x, o| *o = x * c)
}

/// dst += a * c
pub fn dotc_acc<T: Element>(a: &Tensor<T>, c: T, dst: &Tensor<T>) -> Result<()> {
    apply2(a, dst, |x, d| *d = *d + x * c)
}

/// out = a + c
pub fn addc<T: Element>(a: &Tensor<T>, c: T, out: &Tensor<T>) -> Result<()> {
    apply2(a, out, |x, o| *o = x + c)
}

// Pointwise functions

/// out = a where a > thres, else val
pub fn threshold<T: Element>(a: &Tensor<T>, thres: T, val: T, out: &Tensor<T>) -> Result<()> {
    apply2(a, out, |x, o| *o = if x > thres { x } else { val })
}

/// out = a^p
pub fn power<T: Element>(a: &Tensor<T>, p: T, out: &Tensor<T>) -> Result<()> {
    apply2(a, out, |x, o| *o = x.powf(p))
}

/// out = tanh(a)
pub fn tanh<T: Element>(a: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    apply2(a, out, |x, o| *o = x.tanh())
}

/// out = 1 - tanh(a)^2, the derivative of tanh at a
pub fn dtanh<T: Element>(a: &Tensor<T>, out: &Tensor<T>) -> Result<()> {
    apply2(a, out, |x, o| {
        let t = x.tanh();
        *o = T::one() - t * t
    })
}

// Reductions

pub fn sum<T: Element>(a: &Tensor<T>) -> Result<T> {
    fold1(a, T::zero(), |acc, x| acc + x)
}

/// dst (one element) += sum(a)
pub fn sum_acc<T: Element>(a: &Tensor<T>, dst: &Tensor<T>) -> Result<()> {
    let s = sum(a)?;
    apply1(dst, |d| *d = *d + s)
}

/// Smallest element. Fails on an empty view.
pub fn min<T: Element>(a: &Tensor<T>) -> Result<T> {
    fold1(a, None, |acc: Option<T>, x| Some(acc.map_or(x, |m| m.min(x))))?
        .ok_or_else(|| Error::msg("min of an empty view"))
}

/// Largest element. Fails on an empty view.
pub fn max<T: Element>(a: &Tensor<T>) -> Result<T> {
    fold1(a, None, |acc: Option<T>, x| Some(acc.map_or(x, |m| m.max(x))))?
        .ok_or_else(|| Error::msg("max of an empty view"))
}

/// sum(a * b)
pub fn dot<T: Element>(a: &Tensor<T>, b: &Tensor<T>) -> Result<T> {
    fold2(a, b, T::zero(), |acc, x, y| acc + x * y)
}

/// sum(a^2 * b)
pub fn sqr_dot<T: Element>(a: &Tensor<T>, b: &Tensor<T>) -> Result<T> {
    fold2(a, b, T::zero(), |acc, x, y| acc + x * x * y)
}

/// sum((a - b)^2)
pub fn sqrdist<T: Element>(a: &Tensor<T>, b: &Tensor<T>) -> Result<T> {
    fold2(a, b, T::zero(), |acc, x, y| acc + (x - y) * (x - y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(n: usize, shape: impl Into<crate::Shape>) -> Tensor<f64> {
        Tensor::from_vec((0..n).map(|i| i as f64).collect(), shape).unwrap()
    }

    #[test]
    fn test_add_mixed_layouts() {
        // [2, 3] contiguous + transposed view of a [3, 2]
        let a = arange(6, (2, 3));
        let b = arange(6, (3, 2)).transpose(0, 1).unwrap();
        let out = Tensor::zeros((2, 3)).unwrap();
        add(&a, &b, &out).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![0.0, 3.0, 6.0, 4.0, 7.0, 10.0]);
    }

    #[test]
    fn test_contiguous_and_strided_agree() {
        let base = arange(12, (3, 4));
        let strided = base.transpose(0, 1).unwrap();
        let dense = strided.deep_copy().unwrap();
        let w = Tensor::from_vec((0..12).map(|i| 0.5 - i as f64 * 0.1).collect(), (4, 3)).unwrap();
        let out_a = Tensor::zeros((4, 3)).unwrap();
        let out_b = Tensor::zeros((4, 3)).unwrap().transpose(0, 1).unwrap();
        mul(&strided, &w, &out_a).unwrap();
        mul(&dense, &w, &out_b.transpose(0, 1).unwrap()).unwrap();
        let b = out_b.transpose(0, 1).unwrap().to_vec().unwrap();
        assert_eq!(out_a.to_vec().unwrap(), b);
        assert_eq!(sum(&strided).unwrap(), sum(&dense).unwrap());
        assert_eq!(dot(&strided, &w).unwrap(), dot(&dense, &w).unwrap());
    }

    #[test]
    fn test_count_mismatch_fails() {
        let a = arange(6, (2, 3));
        let b = arange(4, (2, 2));
        assert!(matches!(
            add_acc(&a, &b),
            Err(Error::ElementCountMismatch { expected: 6, got: 4, .. })
        ));
    }

    #[test]
    fn test_shapes_may_differ() {
        let a = arange(6, 6);
        let b = Tensor::zeros((2, 3)).unwrap();
        copy(&a, &b).unwrap();
        assert_eq!(b.get(&[1, 0]).unwrap(), 3.0);
    }

    #[test]
    fn test_in_place_alias() {
        let a = arange(4, 4);
        add_acc(&a.clone(), &a).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![0.0, 2.0, 4.0, 6.0]);
        mul(&a, &a, &a).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![0.0, 4.0, 16.0, 36.0]);
    }

    #[test]
    fn test_scalar_ops_and_reductions() {
        let a = arange(4, (2, 2));
        let out = Tensor::zeros(4).unwrap();
        dotc(&a, 2.0, &out).unwrap();
        addc(&out, -1.0, &out).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![-1.0, 1.0, 3.0, 5.0]);
        assert_eq!(min(&out).unwrap(), -1.0);
        assert_eq!(max(&out).unwrap(), 5.0);
        assert_eq!(sqrdist(&a, &out).unwrap(), 1.0 + 0.0 + 1.0 + 4.0);
        threshold(&out, 2.0, 0.5, &out).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![0.5, 0.5, 3.0, 5.0]);
        let s = Tensor::scalar(1.0);
        sum_acc(&a, &s).unwrap();
        assert_eq!(s.to_scalar().unwrap(), 7.0);
        assert!(min(&Tensor::<f64>::zeros(0).unwrap()).is_err());
    }

    #[test]
    fn test_tanh_and_derivative() {
        let a = Tensor::<f64>::from_vec(vec![0.0, 1.0], 2).unwrap();
        let t = Tensor::zeros(2).unwrap();
        let d = Tensor::zeros(2).unwrap();
        tanh(&a, &t).unwrap();
        dtanh(&a, &d).unwrap();
        let tv = t.to_vec().unwrap();
        let dv = d.to_vec().unwrap();
        assert!((tv[1] - 0.761594).abs() < 1e-6);
        assert!((dv[0] - 1.0).abs() < 1e-12);
        assert!((dv[1] - (1.0 - tv[1] * tv[1])).abs() < 1e-12);
    }
}
