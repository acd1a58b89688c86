//! Gaussian noise for simulated sensor values.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::f64::consts::TAU;

/// Gaussian perturbation of simulated sensor values
///
/// Draws use the Box–Muller transform over any uniform source, so tests can
/// pass a seeded generator and get repeatable sequences.
#[derive(Debug, Clone)]
pub struct NoiseModel<R = StdRng> {
    rng: R,
}

impl NoiseModel<StdRng> {
    /// Create a noise model seeded from operating system entropy
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng> NoiseModel<R> {
    /// Create a noise model over the given uniform source
    pub const fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Draw from a normal distribution with the given mean and standard deviation
    pub fn gaussian(&mut self, mean: f64, std_dev: f64) -> f64 {
        // (0, 1] keeps ln() finite
        let u1 = 1.0 - self.rng.gen::<f64>();
        let u2 = self.rng.gen::<f64>();
        let z0 = (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos();
        mean + z0 * std_dev
    }

    /// Perturb `mean` so that three standard deviations equal `relative_percent` of it
    ///
    /// `sample(100.0, 0.10)` stays within ±10 W of 100 W about 99.7% of the time.
    /// The result is not clamped; callers bound it to what the wire format accepts.
    pub fn sample(&mut self, mean: f64, relative_percent: f64) -> f64 {
        self.gaussian(mean, mean * relative_percent / 3.0)
    }
}
