//! Seeded random variates for the Gibbs sampler.
//!
//! Every draw of a run comes from one `Pcg64` stream seeded by the configured integer,
//! so a run is reproducible end to end. Variances, not standard deviations, are the
//! parameters of the normal draws.

use rand::Rng;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_distr::{Beta, ChiSquared, Dirichlet, Distribution, Gamma, Normal, Open01};
use rand_pcg::Pcg64;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot draw from {distribution} with {parameters}")]
pub struct DrawError {
    pub distribution: &'static str,
    pub parameters: String,
}

pub struct Distributions {
    rng: Pcg64,
}

impl Distributions {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Pcg64::seed_from_u64(seed),
        }
    }

    /// The underlying generator, for samplers that draw their own uniforms.
    pub fn rng(&mut self) -> &mut Pcg64 {
        &mut self.rng
    }

    /// A uniform draw on the open interval (0, 1).
    pub fn uniform(&mut self) -> f64 {
        self.rng.sample(Open01)
    }

    pub fn normal(&mut self, mean: f64, variance: f64) -> Result<f64, DrawError> {
        let normal = Normal::new(mean, variance.sqrt()).map_err(|_| DrawError {
            distribution: "Normal",
            parameters: format!("mean {mean}, variance {variance}"),
        })?;
        Ok(normal.sample(&mut self.rng))
    }

    /// `df * scale / chi2(df)`, the conjugate posterior of a normal variance.
    pub fn inv_scaled_chisq(&mut self, df: f64, scale: f64) -> Result<f64, DrawError> {
        let invalid = || DrawError {
            distribution: "scaled inverse chi-square",
            parameters: format!("df {df}, scale {scale}"),
        };
        if !(scale.is_finite() && scale > 0.0) {
            return Err(invalid());
        }
        let chi = ChiSquared::new(df).map_err(|_| invalid())?;
        Ok(df * scale / chi.sample(&mut self.rng))
    }

    /// `1 / Gamma(shape, rate = scale)`.
    pub fn inv_gamma(&mut self, shape: f64, scale: f64) -> Result<f64, DrawError> {
        let gamma = Gamma::new(shape, 1.0 / scale).map_err(|_| DrawError {
            distribution: "inverse gamma",
            parameters: format!("shape {shape}, scale {scale}"),
        })?;
        Ok(1.0 / gamma.sample(&mut self.rng))
    }

    pub fn beta(&mut self, a: f64, b: f64) -> Result<f64, DrawError> {
        let beta = Beta::new(a, b).map_err(|_| DrawError {
            distribution: "Beta",
            parameters: format!("a {a}, b {b}"),
        })?;
        Ok(beta.sample(&mut self.rng))
    }

    pub fn dirichlet(&mut self, alpha: &[f64]) -> Result<Vec<f64>, DrawError> {
        let dirichlet = Dirichlet::new(alpha).map_err(|_| DrawError {
            distribution: "Dirichlet",
            parameters: format!("alpha {alpha:?}"),
        })?;
        Ok(dirichlet.sample(&mut self.rng))
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Distributions::new(7);
        let mut b = Distributions::new(7);
        for _ in 0..10 {
            assert_eq!(a.uniform(), b.uniform());
        }
        assert_eq!(a.normal(1.0, 2.0).unwrap(), b.normal(1.0, 2.0).unwrap());
    }

    #[test]
    fn inverse_scaled_chi_square_has_the_right_mean() {
        // E = df * s / (df - 2)
        let mut d = Distributions::new(11);
        let n = 20_000;
        let mean: f64 = (0..n)
            .map(|_| d.inv_scaled_chisq(10.0, 2.0).unwrap())
            .sum::<f64>()
            / n as f64;
        assert_relative_eq!(mean, 2.5, max_relative = 0.05);
    }

    #[test]
    fn inverse_gamma_has_the_right_mean() {
        // E = b / (a - 1)
        let mut d = Distributions::new(3);
        let n = 20_000;
        let mean: f64 = (0..n).map(|_| d.inv_gamma(6.0, 5.0).unwrap()).sum::<f64>() / n as f64;
        assert_relative_eq!(mean, 1.0, max_relative = 0.05);
    }

    #[test]
    fn dirichlet_draws_lie_on_the_simplex() {
        let mut d = Distributions::new(5);
        let p = d.dirichlet(&[3.0, 1.0, 1.0, 2.0]).unwrap();
        assert_eq!(p.len(), 4);
        assert_relative_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(p.iter().all(|&x| x > 0.0));
    }

    #[test]
    fn invalid_parameters_are_errors() {
        let mut d = Distributions::new(1);
        assert!(d.normal(0.0, f64::NAN).is_err());
        assert!(d.inv_gamma(-1.0, 1.0).is_err());
        assert!(d.dirichlet(&[1.0, 0.0]).is_err());
        assert!(d.inv_scaled_chisq(3.0, 0.0).is_err());
    }
}
