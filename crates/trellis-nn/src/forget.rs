// Parameter (re)initialisation
//
// `forget` draws fresh weights. Each module scales a uniform draw by its own
// fan-in: for a fan-in `n`, weights are drawn from U(-z, z) with
// z = value / n^exponent. With value = 1 and exponent = 0.5 this is the
// classic 1/sqrt(fan_in) initialisation.

use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};
use trellis_core::{ops, Result, Tensor};

use crate::Element;

/// Scale and random source for `Module::forget`.
#[derive(Debug, Clone)]
pub struct ForgetParam {
    pub value: f64,
    pub exponent: f64,
    rng: StdRng,
}

impl ForgetParam {
    /// Non-reproducible initialisation seeded from the thread rng.
    pub fn new(value: f64, exponent: f64) -> Self {
        let seed = thread_rng().gen();
        ForgetParam::with_seed(value, exponent, seed)
    }

    /// Reproducible initialisation.
    pub fn with_seed(value: f64, exponent: f64, seed: u64) -> Self {
        ForgetParam {
            value,
            exponent,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// value / fan_in^exponent
    pub fn scale(&self, fan_in: usize) -> f64 {
        self.value / (fan_in.max(1) as f64).powf(self.exponent)
    }

    /// One draw from U(-z, z).
    pub fn uniform<T: Element>(&mut self, z: f64) -> T {
        let z = z.abs();
        T::from_f64(self.rng.gen_range(-z..=z))
    }

    /// Fill `t` with draws from U(-z, z) where z = scale(fan_in).
    pub fn fill_uniform<T: Element>(&mut self, t: &Tensor<T>, fan_in: usize) -> Result<()> {
        let z = self.scale(fan_in);
        ops::apply1(t, |v| *v = self.uniform(z))
    }
}

impl Default for ForgetParam {
    fn default() -> Self {
        ForgetParam::new(1.0, 0.5)
    }
}
