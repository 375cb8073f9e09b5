//! The Gaussian mixture family.
//!
//! The phenotype is centred and scaled to unit variance. Effects have a mixture prior
//! with a point mass at zero and normal components of variance `cVa[k] * sigmaG`;
//! every conditional is conjugate, so each marker update is a categorical draw of the
//! component followed by a normal draw of the effect.

use crate::config::{GaussianPriors, ModelConfig};
use crate::distributions::Distributions;
use crate::kernel::Kernel;
use crate::marker::Marker;
use crate::types::{Residual, dot_slices};
use crate::writer::SampleLayout;

use super::{Covariates, ModelState, SamplerError, component_probabilities, select_component};

pub(crate) struct GaussianModel {
    priors: GaussianPriors,
    component_variances: Vec<f64>,
    markers: usize,
    sigma_e: f64,
    sigma_g: f64,
    covariates: Covariates,
    log_likelihoods: Vec<f64>,
    means: Vec<f64>,
    denominators: Vec<f64>,
}

impl GaussianModel {
    pub(crate) fn init(
        config: &ModelConfig,
        phenotype: &[f64],
        markers: usize,
        covariates: Covariates,
        dist: &mut Distributions,
    ) -> Result<(Self, ModelState), SamplerError> {
        let n = phenotype.len() as f64;
        let mean = phenotype.iter().sum::<f64>() / n;
        let ss: f64 = phenotype.iter().map(|y| (y - mean).powi(2)).sum();
        let sd = (ss / (n - 1.0)).sqrt();
        if !(sd.is_finite() && sd > 0.0) {
            return Err(SamplerError::ConstantPhenotype);
        }
        let residual = Residual::new(phenotype.iter().map(|y| (y - mean) / sd).collect());

        let component_variances = config.component_variances();
        let grid_total: f64 = config.mixture_variances.iter().sum();
        let pi: Vec<f64> = component_variances
            .iter()
            .enumerate()
            .map(|(k, &c)| if k == 0 { 0.5 } else { 0.5 * c / grid_total })
            .collect();

        let sigma_g = dist.beta(1.0, 1.0)?;
        let sigma_e = residual.squared_norm() / n * 0.5;
        let components = component_variances.len();
        let state = ModelState::new(residual, markers, pi, covariates.len());
        log::debug!("Gaussian start: sigmaG {sigma_g:.6}, sigmaE {sigma_e:.6}.");

        Ok((
            Self {
                priors: config.gaussian,
                component_variances,
                markers,
                sigma_e,
                sigma_g,
                covariates,
                log_likelihoods: vec![0.0; components],
                means: vec![0.0; components],
                denominators: vec![0.0; components],
            },
            state,
        ))
    }

    /// Component counts start from zero each sweep.
    pub(crate) fn count_seed(&self) -> usize {
        0
    }

    /// Intercept, then covariate effects, each from its normal full conditional.
    pub(crate) fn before_sweep(
        &mut self,
        state: &mut ModelState,
        dist: &mut Distributions,
    ) -> Result<(), SamplerError> {
        let n = state.residual.len() as f64;
        let mu_old = state.mu;
        let mu = dist.normal(state.residual.mean() + mu_old, self.sigma_e / n)?;
        state.residual.shift(mu_old - mu);
        state.mu = mu;

        for (f, (column, &xtx)) in self
            .covariates
            .columns
            .iter()
            .zip(&self.covariates.squared_norms)
            .enumerate()
        {
            if xtx == 0.0 {
                continue;
            }
            state.residual.add_scaled(column, state.theta[f]);
            let xty = dot_slices(column, state.residual.values());
            let theta = dist.normal(xty / xtx, self.sigma_e / xtx)?;
            state.residual.add_scaled(column, -theta);
            state.theta[f] = theta;
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
        let squared_norm = marker.squared_norm();
        // x . (epsilon + beta_old * x), without touching the residual.
        let num = marker.dot_residual(&state.residual) + beta_old * squared_norm;
        let ratio = self.sigma_e / self.sigma_g;

        self.log_likelihoods[0] = state.pi[0].ln();
        for k in 1..self.component_variances.len() {
            let c = self.component_variances[k];
            let denom = squared_norm + ratio / c;
            let muk = num / denom;
            self.denominators[k] = denom;
            self.means[k] = muk;
            self.log_likelihoods[k] = state.pi[k].ln()
                - 0.5 * (squared_norm * c / ratio + 1.0).ln()
                + 0.5 * muk * num / self.sigma_e;
        }
        if self.log_likelihoods.iter().any(|l| l.is_nan()) {
            return Err(SamplerError::degenerate(format!(
                "log-likelihoods of {index} are {:?}",
                self.log_likelihoods
            )));
        }

        let probabilities = component_probabilities(&self.log_likelihoods);
        let component = select_component(&probabilities, dist.uniform());
        let beta = if component == 0 {
            0.0
        } else {
            dist.normal(
                self.means[component],
                self.sigma_e / self.denominators[component],
            )?
        };
        log::trace!("{index}: component {component}, beta {beta:.6e}");

        if beta != beta_old {
            marker.update_residual(&mut state.residual, beta_old, beta);
        }
        state.record(index, component, beta, &self.component_variances);
        Ok(())
    }

    /// Genetic and residual variances, then the mixture proportions.
    pub(crate) fn after_sweep(
        &mut self,
        state: &mut ModelState,
        dist: &mut Distributions,
    ) -> Result<(), SamplerError> {
        let p = &self.priors;
        let m0 = (self.markers - state.counts[0]) as f64;
        let df_g = p.v0_g + m0;
        self.sigma_g = dist.inv_scaled_chisq(df_g, (state.betasqn + p.v0_g * p.s02_g) / df_g)?;

        let n = state.residual.len() as f64;
        let df_e = p.v0_e + n;
        let sse = state.residual.squared_norm();
        self.sigma_e = dist.inv_scaled_chisq(df_e, (sse + p.v0_e * p.s02_e) / df_e)?;

        if !(self.sigma_g.is_finite() && self.sigma_e.is_finite()) {
            return Err(SamplerError::degenerate(format!(
                "sigmaG {} and sigmaE {} after the variance draws",
                self.sigma_g, self.sigma_e
            )));
        }

        let alpha: Vec<f64> = state.counts.iter().map(|&c| c as f64 + 1.0).collect();
        state.pi = dist.dirichlet(&alpha)?;
        Ok(())
    }

    pub(crate) fn layout(&self, state: &ModelState, emit_residuals: bool) -> SampleLayout {
        SampleLayout::gaussian(
            self.markers,
            state.theta.len(),
            emit_residuals.then_some(state.residual.len()),
        )
    }

    pub(crate) fn row(&self, state: &ModelState, emit_residuals: bool) -> Vec<f64> {
        let mut row = Vec::with_capacity(
            3 + state.theta.len() + 2 * self.markers + state.residual.len(),
        );
        row.push(state.mu);
        row.extend_from_slice(&state.theta);
        row.extend_from_slice(&state.beta);
        row.push(self.sigma_e);
        row.push(self.sigma_g);
        row.extend(state.components.iter().map(|&c| c as f64));
        if emit_residuals {
            row.extend_from_slice(state.residual.values());
        }
        row
    }

    pub(crate) fn summary(&self) -> String {
        format!("sigmaG {:.6}, sigmaE {:.6}", self.sigma_g, self.sigma_e)
    }
}
