use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::pipeline::{DEFAULT_MAX_IN_FLIGHT, PipelineLimits};
use crate::quadrature::QuadratureOrder;
use crate::types::MarkerKind;

// --- Public Data Structures ---
// These structs define the TOML run configuration. Every field has a default, so a
// configuration file only needs to name what it overrides.

/// The likelihood family of the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// Gaussian residuals with a mixture-of-normals effect prior.
    Gaussian,
    /// Weibull survival times (log scale) with adaptive-quadrature marginals.
    Weibull,
}

/// Hyperparameters of the Gaussian family's variance priors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianPriors {
    pub v0_e: f64,
    pub s02_e: f64,
    pub v0_g: f64,
    pub s02_g: f64,
}

impl Default for GaussianPriors {
    fn default() -> Self {
        Self {
            v0_e: 0.0001,
            s02_e: 0.0001,
            v0_g: 0.0001,
            s02_g: 0.0001,
        }
    }
}

/// Hyperparameters of the Weibull family, plus the half-widths of the sampling
/// brackets used for the intercept and the covariate effects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeibullPriors {
    pub alpha_0: f64,
    pub kappa_0: f64,
    pub sigma_mu: f64,
    pub alpha_sigma: f64,
    pub beta_sigma: f64,
    pub mu_bracket: f64,
    pub theta_bracket: f64,
}

impl Default for WeibullPriors {
    fn default() -> Self {
        Self {
            alpha_0: 0.01,
            kappa_0: 0.01,
            sigma_mu: 100.0,
            alpha_sigma: 1.0,
            beta_sigma: 0.0001,
            mu_bracket: 3.0,
            theta_bracket: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_in_flight: usize,
    pub workers: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            workers: num_cpus::get().max(1),
        }
    }
}

impl From<PipelineSettings> for PipelineLimits {
    fn from(s: PipelineSettings) -> Self {
        PipelineLimits {
            max_in_flight: s.max_in_flight,
            workers: s.workers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub kind: MarkerKind,
    pub compressed: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: MarkerKind::Dense,
            compressed: false,
        }
    }
}

/// The complete description of one sampler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub family: ModelFamily,
    pub chain_length: usize,
    pub burn_in: usize,
    pub thinning: usize,
    pub seed: u64,
    /// Variances of the non-null mixture components, in units of the genetic
    /// variance. The null component is implicit.
    pub mixture_variances: Vec<f64>,
    pub quadrature_points: QuadratureOrder,
    /// Append the residual vector to every Gaussian sample row.
    pub emit_residuals: bool,
    pub gaussian: GaussianPriors,
    pub weibull: WeibullPriors,
    pub pipeline: PipelineSettings,
    pub storage: StorageSettings,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            family: ModelFamily::Gaussian,
            chain_length: 10_000,
            burn_in: 5_000,
            thinning: 10,
            seed: 1,
            mixture_variances: vec![0.01, 0.001, 0.0001],
            quadrature_points: QuadratureOrder::default(),
            emit_residuals: true,
            gaussian: GaussianPriors::default(),
            weibull: WeibullPriors::default(),
            pipeline: PipelineSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

/// Reasons a configuration is refused before any sampling starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("burn-in ({burn_in}) must be smaller than the chain length ({chain_length})")]
    BurnInTooLong { burn_in: usize, chain_length: usize },
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
    #[error("the mixture variance grid is empty")]
    EmptyGrid,
    #[error("mixture variance #{position} is {value}; every variance must be finite and positive")]
    InvalidVariance { position: usize, value: f64 },
    #[error("mixture variance {value} appears more than once")]
    DuplicateVariance { value: f64 },
    #[error("hyperparameter {name} is {value}; it must be finite and non-negative")]
    InvalidPrior { name: &'static str, value: f64 },
    #[error("hyperparameter {name} is {value}; it must be positive")]
    NonPositive { name: &'static str, value: f64 },
}

impl ModelConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Number of mixture components including the null component.
    pub fn components(&self) -> usize {
        self.mixture_variances.len() + 1
    }

    /// `[0, S...]`: the component variances with the null component first.
    pub fn component_variances(&self) -> Vec<f64> {
        std::iter::once(0.0)
            .chain(self.mixture_variances.iter().copied())
            .collect()
    }

    /// Iterations whose state is written out.
    pub fn is_retained(&self, iteration: usize) -> bool {
        iteration >= self.burn_in && iteration % self.thinning == 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("chain_length", self.chain_length),
            ("thinning", self.thinning),
            ("pipeline.max_in_flight", self.pipeline.max_in_flight),
            ("pipeline.workers", self.pipeline.workers),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.burn_in >= self.chain_length {
            return Err(ConfigError::BurnInTooLong {
                burn_in: self.burn_in,
                chain_length: self.chain_length,
            });
        }

        if self.mixture_variances.is_empty() {
            return Err(ConfigError::EmptyGrid);
        }
        for (position, &value) in self.mixture_variances.iter().enumerate() {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidVariance { position, value });
            }
            if self.mixture_variances[..position].contains(&value) {
                return Err(ConfigError::DuplicateVariance { value });
            }
        }

        let g = &self.gaussian;
        let w = &self.weibull;
        for (name, value) in [
            ("gaussian.v0_e", g.v0_e),
            ("gaussian.s02_e", g.s02_e),
            ("gaussian.v0_g", g.v0_g),
            ("gaussian.s02_g", g.s02_g),
            ("weibull.alpha_0", w.alpha_0),
            ("weibull.kappa_0", w.kappa_0),
            ("weibull.beta_sigma", w.beta_sigma),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidPrior { name, value });
            }
        }
        for (name, value) in [
            ("weibull.sigma_mu", w.sigma_mu),
            ("weibull.alpha_sigma", w.alpha_sigma),
            ("weibull.mu_bracket", w.mu_bracket),
            ("weibull.theta_bracket", w.theta_bracket),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ModelConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config = ModelConfig::from_toml_str(
            r#"
            family = "weibull"
            chain_length = 200
            burn_in = 50
            mixture_variances = [0.001, 0.01]
            quadrature_points = 11

            [storage]
            kind = "sparse-ragged"
            compressed = true
            "#,
        )
        .unwrap();
        assert_eq!(config.family, ModelFamily::Weibull);
        assert_eq!(config.components(), 3);
        assert_eq!(config.component_variances(), vec![0.0, 0.001, 0.01]);
        assert_eq!(config.quadrature_points, QuadratureOrder::Eleven);
        assert_eq!(config.storage.kind, MarkerKind::SparseRagged);
        assert_eq!(config.thinning, 10);
        config.validate().unwrap();
    }

    #[test]
    fn unsupported_quadrature_order_fails_to_parse() {
        assert!(ModelConfig::from_toml_str("quadrature_points = 4").is_err());
    }

    #[test]
    fn burn_in_must_be_shorter_than_the_chain() {
        let config = ModelConfig {
            chain_length: 100,
            burn_in: 100,
            ..ModelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BurnInTooLong { .. })
        ));
    }

    #[test]
    fn zero_in_the_grid_is_rejected() {
        let config = ModelConfig {
            mixture_variances: vec![0.01, 0.0],
            ..ModelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidVariance { position: 1, .. })
        ));
    }

    #[test]
    fn negative_prior_is_rejected() {
        let mut config = ModelConfig::default();
        config.gaussian.v0_e = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPrior { .. })
        ));
    }

    #[test]
    fn retention_follows_burn_in_and_thinning() {
        let config = ModelConfig {
            chain_length: 500,
            burn_in: 100,
            thinning: 5,
            ..ModelConfig::default()
        };
        let kept: Vec<usize> = (0..500).filter(|&i| config.is_retained(i)).collect();
        assert_eq!(kept.len(), 80);
        assert_eq!(kept[0], 100);
        assert_eq!(kept[1], 105);
    }

    #[test]
    fn configuration_round_trips_through_toml() {
        let config = ModelConfig {
            seed: 99,
            ..ModelConfig::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(ModelConfig::from_toml_str(&text).unwrap(), config);
    }
}
