// Pointwise activation modules
//
// Each one applies a scalar function f elementwise and propagates
//
//   in.dx  += f'(x) * out.dx
//   in.ddx += f'(x)^2 * out.ddx
//
// The output always takes the input's shape.
//
// The standard sigmoid is 1.71593428 * tanh(0.66666666 * x): f(1) ~ 1 and
// f(-1) ~ -1, with the largest curvature near +-1.

use trellis_core::{ops, Result, Tensor};

use crate::module::{resize_output, Module};
use crate::state::State;
use crate::Element;

/// Hyperbolic tangent.
pub struct TanhModule {
    name: String,
}

impl TanhModule {
    pub fn new(name: impl Into<String>) -> Self {
        TanhModule { name: name.into() }
    }
}

impl<T: Element> Module<T> for TanhModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        resize_output(&self.name, output, input.shape().clone())?;
        ops::tanh(input.x(), output.x())
    }

    // 1 - tanh^2 is read back from the output value
    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::apply3(output.x(), output.dx()?, input.dx()?, |t, g, d| {
            *d = *d + (T::one() - t * t) * g
        })
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::apply3(output.x(), output.ddx()?, input.ddx()?, |t, g, d| {
            let s = T::one() - t * t;
            *d = *d + s * s * g
        })
    }

    fn describe(&self) -> String {
        format!("tanh module {}", self.name)
    }
}

/// x^p.
pub struct PowerModule<T: Element> {
    name: String,
    p: T,
}

impl<T: Element> PowerModule<T> {
    pub fn new(name: impl Into<String>, p: T) -> Self {
        PowerModule { name: name.into(), p }
    }

    pub fn exponent(&self) -> T {
        self.p
    }

    fn slope(&self, x: T) -> T {
        self.p * x.powf(self.p - T::one())
    }
}

impl<T: Element> Module<T> for PowerModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        resize_output(&self.name, output, input.shape().clone())?;
        ops::power(input.x(), self.p, output.x())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::apply3(input.x(), output.dx()?, input.dx()?, |x, g, d| {
            *d = *d + self.slope(x) * g
        })
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::apply3(input.x(), output.ddx()?, input.ddx()?, |x, g, d| {
            let s = self.slope(x);
            *d = *d + s * s * g
        })
    }

    fn describe(&self) -> String {
        format!("power module {} with exponent {}", self.name, self.p)
    }
}

/// x where x > thres, otherwise the constant `val`.
pub struct ThresModule<T: Element> {
    name: String,
    thres: T,
    val: T,
}

impl<T: Element> ThresModule<T> {
    pub fn new(name: impl Into<String>, thres: T, val: T) -> Self {
        ThresModule {
            name: name.into(),
            thres,
            val,
        }
    }

    /// Change the threshold and the replacement value.
    pub fn set_threshold(&mut self, thres: T, val: T) {
        self.thres = thres;
        self.val = val;
    }

    fn pass(&self, state: &State<T>, grad: &Tensor<T>, acc: &Tensor<T>) -> Result<()> {
        let thres = self.thres;
        ops::apply3(state.x(), grad, acc, |x, g, d| {
            if x > thres {
                *d = *d + g
            }
        })
    }
}

impl<T: Element> Module<T> for ThresModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        resize_output(&self.name, output, input.shape().clone())?;
        ops::threshold(input.x(), self.thres, self.val, output.x())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.pass(input, output.dx()?, input.dx()?)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.pass(input, output.ddx()?, input.ddx()?)
    }

    fn describe(&self) -> String {
        format!(
            "thres module {} with threshold {} and replacement value {}",
            self.name, self.thres, self.val
        )
    }
}

const STD_SIGMOID_GAIN: f64 = 1.71593428;
const STD_SIGMOID_SLOPE: f64 = 0.66666666;

/// Scaled tanh, optionally plus a linear term: 1.7159 tanh(2x/3) + alpha x.
pub struct StdsigmoidModule<T: Element> {
    name: String,
    alpha: T,
}

impl<T: Element> StdsigmoidModule<T> {
    pub fn new(name: impl Into<String>) -> Self {
        StdsigmoidModule::with_linear(name, T::zero())
    }

    pub fn with_linear(name: impl Into<String>, alpha: T) -> Self {
        StdsigmoidModule {
            name: name.into(),
            alpha,
        }
    }

    fn slope(&self, x: T) -> T {
        let (gain, slope) = (T::from_f64(STD_SIGMOID_GAIN), T::from_f64(STD_SIGMOID_SLOPE));
        let t = (slope * x).tanh();
        gain * slope * (T::one() - t * t) + self.alpha
    }
}

impl<T: Element> Module<T> for StdsigmoidModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        resize_output(&self.name, output, input.shape().clone())?;
        let (gain, slope) = (T::from_f64(STD_SIGMOID_GAIN), T::from_f64(STD_SIGMOID_SLOPE));
        let alpha = self.alpha;
        ops::apply2(input.x(), output.x(), |x, y| *y = gain * (slope * x).tanh() + alpha * x)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::apply3(input.x(), output.dx()?, input.dx()?, |x, g, d| {
            *d = *d + self.slope(x) * g
        })
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::apply3(input.x(), output.ddx()?, input.ddx()?, |x, g, d| {
            let s = self.slope(x);
            *d = *d + s * s * g
        })
    }

    fn describe(&self) -> String {
        format!("stdsigmoid module {} with linear coefficient {}", self.name, self.alpha)
    }
}

/// |x|. Gradients are dropped where |x| <= thres.
pub struct AbsModule<T: Element> {
    name: String,
    thres: T,
}

impl<T: Element> AbsModule<T> {
    pub fn new(name: impl Into<String>, thres: T) -> Self {
        AbsModule {
            name: name.into(),
            thres,
        }
    }

    fn sign(&self, x: T) -> T {
        if x > self.thres {
            T::one()
        } else if x < -self.thres {
            -T::one()
        } else {
            T::zero()
        }
    }
}

impl<T: Element> Module<T> for AbsModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        resize_output(&self.name, output, input.shape().clone())?;
        ops::apply2(input.x(), output.x(), |x, y| *y = x.abs())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::apply3(input.x(), output.dx()?, input.dx()?, |x, g, d| {
            *d = *d + self.sign(x) * g
        })
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        ops::apply3(input.x(), output.ddx()?, input.ddx()?, |x, g, d| {
            let s = self.sign(x);
            *d = *d + s * s * g
        })
    }

    fn describe(&self) -> String {
        format!("abs module {} with threshold {}", self.name, self.thres)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<M: Module<f64>>(m: &mut M, x: &[f64]) -> (State<f64>, State<f64>) {
        let mut input = State::from_tensor(Tensor::from_slice(x, x.len()).unwrap());
        let mut out = State::new(1).unwrap();
        m.fprop(&input, &mut out).unwrap();
        out.prepare_dx().unwrap();
        ops::fill(out.dx().unwrap(), 1.0).unwrap();
        input.prepare_dx().unwrap();
        m.bprop(&mut input, &out).unwrap();
        (input, out)
    }

    #[test]
    fn test_tanh() {
        let (input, out) = run(&mut TanhModule::new("t"), &[0.0, 1.0]);
        let y = out.x().to_vec().unwrap();
        assert!((y[1] - 1f64.tanh()).abs() < 1e-12);
        let d = input.dx().unwrap().to_vec().unwrap();
        assert!((d[0] - 1.0).abs() < 1e-12);
        assert!((d[1] - (1.0 - 1f64.tanh().powi(2))).abs() < 1e-12);
    }

    #[test]
    fn test_power() {
        let (input, out) = run(&mut PowerModule::new("p", 3.0), &[2.0, -1.0]);
        assert_eq!(out.x().to_vec().unwrap(), vec![8.0, -1.0]);
        assert_eq!(input.dx().unwrap().to_vec().unwrap(), vec![12.0, 3.0]);
    }

    #[test]
    fn test_thres() {
        let (input, out) = run(&mut ThresModule::new("th", 0.0, -5.0), &[2.0, -1.0, 0.0]);
        assert_eq!(out.x().to_vec().unwrap(), vec![2.0, -5.0, -5.0]);
        assert_eq!(input.dx().unwrap().to_vec().unwrap(), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_tanh_bbprop_squares_slope() {
        let mut m = TanhModule::new("t");
        let (mut input, mut out) = run(&mut m, &[0.5]);
        out.prepare_ddx().unwrap();
        ops::fill(out.ddx().unwrap(), 2.0).unwrap();
        input.prepare_ddx().unwrap();
        Module::<f64>::bbprop(&mut m, &mut input, &out).unwrap();
        let s = 1.0 - 0.5f64.tanh().powi(2);
        assert!((input.ddx().unwrap().to_vec().unwrap()[0] - 2.0 * s * s).abs() < 1e-12);
    }

    #[test]
    fn test_stdsigmoid_fixed_points() {
        let (input, out) = run(&mut StdsigmoidModule::new("s"), &[1.0, -1.0, 0.0]);
        let y = out.x().to_vec().unwrap();
        assert!((y[0] - 1.0).abs() < 1e-4);
        assert!((y[1] + 1.0).abs() < 1e-4);
        assert_eq!(y[2], 0.0);
        // slope at 0 is gain * slope
        let d = input.dx().unwrap().to_vec().unwrap();
        assert!((d[2] - STD_SIGMOID_GAIN * STD_SIGMOID_SLOPE).abs() < 1e-12);
    }

    #[test]
    fn test_stdsigmoid_linear_term() {
        let mut m = StdsigmoidModule::with_linear("s", 0.5);
        let (input, out) = run(&mut m, &[0.0, 2.0]);
        let y = out.x().to_vec().unwrap();
        assert!((y[1] - (STD_SIGMOID_GAIN * (2.0 * STD_SIGMOID_SLOPE).tanh() + 1.0)).abs() < 1e-12);
        let d = input.dx().unwrap().to_vec().unwrap();
        assert!((d[0] - (STD_SIGMOID_GAIN * STD_SIGMOID_SLOPE + 0.5)).abs() < 1e-12);
        assert_eq!(
            Module::<f64>::describe(&m),
            "stdsigmoid module s with linear coefficient 0.5"
        );
    }

    #[test]
    fn test_abs_dead_zone() {
        let mut m = AbsModule::new("a", 0.1);
        let (mut input, mut out) = run(&mut m, &[-2.0, 0.05, 3.0]);
        assert_eq!(out.x().to_vec().unwrap(), vec![2.0, 0.05, 3.0]);
        assert_eq!(input.dx().unwrap().to_vec().unwrap(), vec![-1.0, 0.0, 1.0]);
        out.prepare_ddx().unwrap();
        ops::fill(out.ddx().unwrap(), 4.0).unwrap();
        input.prepare_ddx().unwrap();
        m.bbprop(&mut input, &out).unwrap();
        assert_eq!(input.ddx().unwrap().to_vec().unwrap(), vec![4.0, 0.0, 4.0]);
    }

    #[test]
    fn test_thres_setter() {
        let mut m = ThresModule::new("th", 0.0, 0.0);
        m.set_threshold(1.0, 1.0);
        let (_, out) = run(&mut m, &[0.5, 2.0]);
        assert_eq!(out.x().to_vec().unwrap(), vec![1.0, 2.0]);
    }
}
