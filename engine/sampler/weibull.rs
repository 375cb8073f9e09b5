//! The Weibull survival family.
//!
//! The phenotype holds log survival times `y_i` with event indicators `f_i`. With
//! `epsilon = y - mu - X theta - G beta` and shape `alpha`, the log-likelihood is
//! `sum_i f_i (ln alpha + alpha epsilon_i - gamma) - exp(alpha epsilon_i - gamma)`.
//! No conditional is conjugate: the intercept, covariate effects, shape and marker
//! effects are drawn by adaptive rejection sampling, and the marginal likelihood of
//! each non-null mixture component is an adaptive Gauss-Hermite integral.

use rayon::prelude::*;
use std::f64::consts::PI;

use crate::ars;
use crate::config::{ModelConfig, WeibullPriors};
use crate::distributions::Distributions;
use crate::kernel::{Kernel, WeibullContext};
use crate::marker::Marker;
use crate::quadrature::{QuadratureOrder, adaptive_integral};
use crate::types::{PARALLEL_THRESHOLD, Residual, dot_slices, sum_slice};
use crate::writer::SampleLayout;

use super::{Covariates, ModelState, SamplerError, component_probabilities, select_component};

/// The Euler-Mascheroni constant.
const EULER_GAMMA: f64 = 0.577215664901532;
/// Upper end of the shape bracket, widened when the shape itself approaches it.
const ALPHA_UPPER: f64 = 400.0;

pub(crate) struct WeibullModel {
    priors: WeibullPriors,
    component_variances: Vec<f64>,
    order: QuadratureOrder,
    markers: usize,
    failure: Vec<f64>,
    /// Number of observed failures.
    failures: f64,
    covariates: Covariates,
    /// `sum_i X_if f_i` for every covariate.
    covariate_failures: Vec<f64>,
    alpha: f64,
    sigma_b: f64,
    /// `exp(alpha * epsilon_i - gamma)`, kept in step with the residual during a sweep.
    vi: Vec<f64>,
    vi_total: f64,
    log_marginals: Vec<f64>,
}

impl WeibullModel {
    pub(crate) fn init(
        config: &ModelConfig,
        phenotype: &[f64],
        failure: Vec<f64>,
        markers: usize,
        covariates: Covariates,
    ) -> Result<(Self, ModelState), SamplerError> {
        let n = phenotype.len() as f64;
        let mu = phenotype.iter().sum::<f64>() / n;
        let ss: f64 = phenotype.iter().map(|y| (y - mu).powi(2)).sum();
        let variance = ss / (n - 1.0);
        if !(variance.is_finite() && variance > 0.0) {
            return Err(SamplerError::ConstantPhenotype);
        }
        let alpha = PI / (6.0 * variance).sqrt();
        let sigma_b = PI * PI / (6.0 * alpha * alpha * markers as f64);

        let component_variances = config.component_variances();
        let k = component_variances.len();
        let pi: Vec<f64> = (0..k)
            .map(|c| if c == 0 { 0.99 } else { 0.01 / (k - 1) as f64 })
            .collect();

        let failures: f64 = failure.iter().sum();
        let covariate_failures: Vec<f64> = covariates
            .columns
            .iter()
            .map(|c| dot_slices(c, &failure))
            .collect();

        let residual = Residual::new(phenotype.iter().map(|y| y - mu).collect());
        let mut state = ModelState::new(residual, markers, pi, covariates.len());
        state.mu = mu;
        log::debug!(
            "Weibull start: mu {mu:.6}, alpha {alpha:.6}, sigmaB {sigma_b:.6e}, {failures} failures."
        );

        Ok((
            Self {
                priors: config.weibull,
                component_variances,
                order: config.quadrature_points,
                markers,
                vi: vec![0.0; phenotype.len()],
                vi_total: 0.0,
                failure,
                failures,
                covariates,
                covariate_failures,
                alpha,
                sigma_b,
                log_marginals: vec![0.0; k],
            },
            state,
        ))
    }

    /// Every component count starts at one, so the proportions draw uses the
    /// counts directly.
    pub(crate) fn count_seed(&self) -> usize {
        1
    }

    pub(crate) fn before_sweep(
        &mut self,
        state: &mut ModelState,
        dist: &mut Distributions,
    ) -> Result<(), SamplerError> {
        self.sample_mu(state, dist)?;
        for f in 0..self.covariates.len() {
            self.sample_theta(f, state, dist)?;
        }
        self.refresh_vi(&state.residual)
    }

    fn sample_mu(&self, state: &mut ModelState, dist: &mut Distributions) -> Result<(), SamplerError> {
        let alpha = self.alpha;
        let mu_old = state.mu;
        let exp_total: f64 = state
            .residual
            .values()
            .iter()
            .map(|e| (alpha * (e + mu_old) - EULER_GAMMA).exp())
            .sum();
        let d = self.failures;
        let sigma_mu = self.priors.sigma_mu;
        let density = |x: f64| -alpha * x * d - (-alpha * x).exp() * exp_total - x * x / (2.0 * sigma_mu);

        let w = self.priors.mu_bracket;
        let initial = [mu_old - 0.05 * w, mu_old, mu_old + 0.05 * w, mu_old + 0.1 * w];
        let mu = ars::sample(density, initial, (mu_old - w, mu_old + w), dist.rng())
            .map_err(SamplerError::ars("the intercept"))?;
        state.residual.shift(mu_old - mu);
        state.mu = mu;
        Ok(())
    }

    fn sample_theta(
        &self,
        f: usize,
        state: &mut ModelState,
        dist: &mut Distributions,
    ) -> Result<(), SamplerError> {
        let column = &self.covariates.columns[f];
        let theta_old = state.theta[f];
        state.residual.add_scaled(column, theta_old);

        let alpha = self.alpha;
        let sum_failure = self.covariate_failures[f];
        let sigma_mu = self.priors.sigma_mu;
        let eps = state.residual.values();
        let density = |x: f64| {
            let exp_sum: f64 = eps
                .iter()
                .zip(column)
                .map(|(e, c)| ((e - c * x) * alpha - EULER_GAMMA).exp())
                .sum();
            -alpha * x * sum_failure - exp_sum - x * x / (2.0 * sigma_mu)
        };

        let w = self.priors.theta_bracket;
        let initial = [
            theta_old - 0.05 * w,
            theta_old,
            theta_old + 0.025 * w,
            theta_old + 0.05 * w,
        ];
        let theta = ars::sample(density, initial, (theta_old - w, theta_old + w), dist.rng())
            .map_err(SamplerError::ars(format!("covariate effect {}", f + 1)))?;
        state.residual.add_scaled(column, -theta);
        state.theta[f] = theta;
        Ok(())
    }

    fn refresh_vi(&mut self, residual: &Residual) -> Result<(), SamplerError> {
        let alpha = self.alpha;
        let eps = residual.values();
        if eps.len() >= PARALLEL_THRESHOLD {
            self.vi
                .par_iter_mut()
                .zip(eps.par_iter())
                .for_each(|(v, e)| *v = (alpha * e - EULER_GAMMA).exp());
        } else {
            self.vi
                .iter_mut()
                .zip(eps)
                .for_each(|(v, e)| *v = (alpha * e - EULER_GAMMA).exp());
        }
        self.vi_total = sum_slice(&self.vi);
        if !self.vi_total.is_finite() {
            return Err(SamplerError::degenerate(format!(
                "sum of exp(alpha * epsilon - gamma) is {} with alpha {alpha}",
                self.vi_total
            )));
        }
        Ok(())
    }

    pub(crate) fn update_marker(
        &mut self,
        state: &mut ModelState,
        marker: &Marker,
        dist: &mut Distributions,
    ) -> Result<(), SamplerError> {
        let index = marker.index();
        let beta_old = state.beta[index.get()];
        if beta_old != 0.0 {
            marker.update_residual(&mut state.residual, beta_old, 0.0);
            self.refresh_vi(&state.residual)?;
        }

        let ctx = WeibullContext {
            vi: &self.vi,
            vi_total: self.vi_total,
            failure: &self.failure,
            failure_total: self.failures,
        };
        let terms = marker.weibull_terms(&ctx);
        let alpha = self.alpha;
        let sigma_b = self.sigma_b;

        // The null marginal carries the sqrt(pi) that the Gauss-Hermite weights
        // leave on the others.
        self.log_marginals[0] = state.pi[0].ln() + 0.5 * PI.ln();
        for k in 1..self.component_variances.len() {
            let c = self.component_variances[k];
            let width = 1.0 / (1.0 + alpha * alpha * sigma_b * c * terms.exponent_sum).sqrt();
            let scale = (2.0 * c * sigma_b).sqrt();
            let integral = adaptive_integral(self.order, width, |s| terms.integrand(s, alpha, scale));
            if !integral.is_finite() {
                return Err(SamplerError::degenerate(format!(
                    "marginal likelihood of component {k} for {index} is {integral}"
                )));
            }
            self.log_marginals[k] = state.pi[k].ln() + integral.ln();
        }

        let probabilities = component_probabilities(&self.log_marginals);
        let component = select_component(&probabilities, dist.uniform());
        let beta = if component == 0 {
            0.0
        } else {
            let prior_variance = self.component_variances[component] * sigma_b;
            let safe = 2.0 * prior_variance.sqrt();
            let initial = [
                beta_old - safe / 10.0,
                beta_old,
                beta_old + safe / 20.0,
                beta_old + safe / 10.0,
            ];
            ars::sample(
                |x| terms.effect_log_density(x, alpha, prior_variance),
                initial,
                (beta_old - safe, beta_old + safe),
                dist.rng(),
            )
            .map_err(SamplerError::ars(format!("the effect of {index}")))?
        };
        log::trace!("{index}: component {component}, beta {beta:.6e}");

        if beta != 0.0 {
            marker.update_residual(&mut state.residual, 0.0, beta);
            self.refresh_vi(&state.residual)?;
        }
        state.record(index, component, beta, &self.component_variances);
        Ok(())
    }

    /// Shape, effect-size scale, then the mixture proportions.
    pub(crate) fn after_sweep(
        &mut self,
        state: &mut ModelState,
        dist: &mut Distributions,
    ) -> Result<(), SamplerError> {
        self.sample_alpha(&state.residual, dist)?;

        let p = &self.priors;
        let m0 = (self.markers + 1 - state.counts[0]) as f64;
        self.sigma_b = dist.inv_gamma(p.alpha_sigma + 0.5 * m0, p.beta_sigma + 0.5 * state.betasqn)?;
        if !(self.sigma_b.is_finite() && self.sigma_b > 0.0) {
            return Err(SamplerError::degenerate(format!(
                "sigmaB is {} after its draw",
                self.sigma_b
            )));
        }

        let alpha: Vec<f64> = state.counts.iter().map(|&c| c as f64).collect();
        state.pi = dist.dirichlet(&alpha)?;
        Ok(())
    }

    fn sample_alpha(&mut self, residual: &Residual, dist: &mut Distributions) -> Result<(), SamplerError> {
        let eps = residual.values();
        let shape = self.priors.alpha_0 + self.failures - 1.0;
        let linear = dot_slices(eps, &self.failure) - self.priors.kappa_0;
        let density = |x: f64| {
            let exp_sum: f64 = eps.iter().map(|e| (x * e - EULER_GAMMA).exp()).sum();
            shape * x.ln() + x * linear - exp_sum
        };
        let a = self.alpha;
        let upper = ALPHA_UPPER.max(4.0 * a);
        self.alpha = ars::sample(density, [0.5 * a, a, 1.5 * a, 3.0 * a], (0.0, upper), dist.rng())
            .map_err(SamplerError::ars("the shape parameter"))?;
        Ok(())
    }

    pub(crate) fn layout(&self, state: &ModelState) -> SampleLayout {
        SampleLayout::weibull(self.markers, state.theta.len())
    }

    pub(crate) fn row(&self, state: &ModelState) -> Vec<f64> {
        let mut row = Vec::with_capacity(3 + state.theta.len() + 2 * self.markers);
        row.push(self.alpha);
        row.push(state.mu);
        row.extend_from_slice(&state.theta);
        row.extend_from_slice(&state.beta);
        row.extend(state.components.iter().map(|&c| c as f64));
        row.push(self.sigma_b);
        row
    }

    pub(crate) fn summary(&self) -> String {
        format!("alpha {:.6}, sigmaB {:.6e}", self.alpha, self.sigma_b)
    }
}
