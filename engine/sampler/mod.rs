// ========================================================================================
//
//                         The marker-wise Gibbs sampler core
//
// ========================================================================================
//
// One iteration is: family-specific pre-sweep draws (intercept, covariates), a
// shuffled sweep over every marker through the ordered pipeline, then the variance and
// mixture-proportion draws. All random draws come from one seeded stream on the
// calling thread, so a run is reproducible for a fixed seed whatever the number of
// build workers.

mod gaussian;
mod weibull;

use ndarray::Array2;
use std::time::Instant;
use thiserror::Error;

use crate::ars::ArsError;
use crate::config::{ConfigError, ModelConfig, ModelFamily};
use crate::distributions::{DrawError, Distributions};
use crate::io::{MarkerSource, StoreError};
use crate::marker::Marker;
use crate::pipeline::{PipelineError, PipelineLimits, SweepStats, create_progress_bar, run_ordered};
use crate::types::{MarkerIndex, Residual, dot_slices};
use crate::writer::{SampleLayout, SampleRow, SampleSink, SinkError};

use self::gaussian::GaussianModel;
use self::weibull::WeibullModel;

/// Log-likelihood differences beyond this are treated as a probability of zero
/// rather than evaluated.
pub const OVERFLOW_GUARD: f64 = 700.0;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("adaptive rejection sampling failed for {target}: {source}")]
    Ars {
        target: String,
        #[source]
        source: ArsError,
    },
    #[error(transparent)]
    Draw(#[from] DrawError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("numerical degeneracy: {context}")]
    NumericalDegeneracy { context: String },
    #[error("{what} has {found} entries but the genotype store has {expected} individuals")]
    InputLength {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("the weibull family needs a failure indicator vector")]
    MissingFailure,
    #[error("failure indicator of individual {individual} is {value}; expected 0 or 1")]
    InvalidFailure { individual: usize, value: f64 },
    #[error("the phenotype has zero variance")]
    ConstantPhenotype,
    #[error("the genotype store has {markers} markers; at most {} are supported", u32::MAX)]
    TooManyMarkers { markers: usize },
}

impl SamplerError {
    pub(crate) fn ars(target: impl Into<String>) -> impl FnOnce(ArsError) -> SamplerError {
        let target = target.into();
        move |source| SamplerError::Ars { target, source }
    }

    pub(crate) fn degenerate(context: impl Into<String>) -> SamplerError {
        SamplerError::NumericalDegeneracy {
            context: context.into(),
        }
    }
}

// ========================================================================================
//                                   Model state
// ========================================================================================

/// The chain state shared by both families. Family-specific scalars (variances, the
/// Weibull shape) live in the family models.
#[derive(Debug, Clone)]
pub struct ModelState {
    /// The working residual. Between sweeps it equals the phenotype minus every
    /// current effect.
    pub residual: Residual,
    pub beta: Vec<f64>,
    /// Mixture component of every marker; 0 is the null component.
    pub components: Vec<usize>,
    pub mu: f64,
    /// Covariate effects, empty without covariates.
    pub theta: Vec<f64>,
    /// Mixture proportions.
    pub pi: Vec<f64>,
    /// Per-sweep component counts, including the family's pseudocount seed.
    pub counts: Vec<usize>,
    /// `sum_j beta_j^2 / cVa[comp_j]` over the non-null markers, accumulated during
    /// the sweep.
    pub betasqn: f64,
}

impl ModelState {
    pub(crate) fn new(residual: Residual, markers: usize, pi: Vec<f64>, theta: usize) -> Self {
        let components = pi.len();
        Self {
            residual,
            beta: vec![0.0; markers],
            components: vec![0; markers],
            mu: 0.0,
            theta: vec![0.0; theta],
            pi,
            counts: vec![0; components],
            betasqn: 0.0,
        }
    }

    /// Markers currently outside the null component.
    pub fn included(&self) -> usize {
        self.components.iter().filter(|&&c| c != 0).count()
    }

    /// `betasqn` recomputed from `beta` and `components`.
    pub fn recomputed_betasqn(&self, component_variances: &[f64]) -> f64 {
        self.beta
            .iter()
            .zip(&self.components)
            .filter(|&(_, &c)| c != 0)
            .map(|(b, &c)| b * b / component_variances[c])
            .sum()
    }

    /// Records the outcome of one marker update in the sweep accumulators.
    pub(crate) fn record(
        &mut self,
        marker: MarkerIndex,
        component: usize,
        beta: f64,
        component_variances: &[f64],
    ) {
        let j = marker.get();
        self.beta[j] = beta;
        self.components[j] = component;
        self.counts[component] += 1;
        if component != 0 {
            self.betasqn += beta * beta / component_variances[component];
        }
    }

    pub(crate) fn reset_sweep(&mut self, seed: usize) {
        self.counts.iter_mut().for_each(|c| *c = seed);
        self.betasqn = 0.0;
    }
}

// ========================================================================================
//                               Mixture component choice
// ========================================================================================

/// Posterior component probabilities from per-component log-likelihoods.
///
/// `p_k = 1 / sum_j exp(L_j - L_k)`. A component is given exactly zero probability as
/// soon as one difference exceeds the overflow guard.
///
/// The guard only looks at components with a larger log-likelihood than `L_k`. A
/// difference far below zero just underflows its term to zero, which is harmless.
pub fn component_probabilities(log_likelihoods: &[f64]) -> Vec<f64> {
    log_likelihoods
        .iter()
        .map(|&lk| {
            if lk == f64::NEG_INFINITY {
                return 0.0;
            }
            let mut total = 0.0;
            for &lj in log_likelihoods {
                let diff = lj - lk;
                if diff > OVERFLOW_GUARD {
                    return 0.0;
                }
                total += diff.exp();
            }
            1.0 / total
        })
        .collect()
}

/// Inverse-CDF walk: the first component whose cumulative probability reaches `u`.
/// Rounding can leave the total just short of `u`; the last component takes it.
pub fn select_component(probabilities: &[f64], u: f64) -> usize {
    let mut acc = 0.0;
    for (k, &p) in probabilities.iter().enumerate() {
        acc += p;
        if u <= acc {
            return k;
        }
    }
    probabilities.len().saturating_sub(1)
}

// ========================================================================================
//                                      Inputs
// ========================================================================================

/// Per-individual inputs of a run besides the genotypes.
#[derive(Debug, Clone, Default)]
pub struct SamplerInput {
    /// Quantitative phenotype for the Gaussian family, log survival times for the
    /// Weibull family.
    pub phenotype: Vec<f64>,
    /// Event indicator (1 = observed failure, 0 = censored). Weibull only.
    pub failure: Option<Vec<f64>>,
    /// Fixed covariates, one row per individual.
    pub covariates: Option<Array2<f64>>,
}

/// Covariate columns laid out contiguously for the residual arithmetic.
#[derive(Debug, Clone, Default)]
pub(crate) struct Covariates {
    pub columns: Vec<Vec<f64>>,
    pub squared_norms: Vec<f64>,
}

impl Covariates {
    fn from_matrix(matrix: Option<&Array2<f64>>, individuals: usize) -> Result<Self, SamplerError> {
        let Some(matrix) = matrix else {
            return Ok(Self::default());
        };
        if matrix.nrows() != individuals {
            return Err(SamplerError::InputLength {
                what: "the covariate matrix",
                expected: individuals,
                found: matrix.nrows(),
            });
        }
        let columns: Vec<Vec<f64>> = matrix.columns().into_iter().map(|c| c.to_vec()).collect();
        let squared_norms = columns.iter().map(|c| dot_slices(c, c)).collect();
        Ok(Self {
            columns,
            squared_norms,
        })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }
}

// ========================================================================================
//                                    The sampler
// ========================================================================================

enum FamilyModel {
    Gaussian(GaussianModel),
    Weibull(WeibullModel),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: usize,
    pub retained: usize,
    /// Largest number of markers in flight in any sweep.
    pub peak_in_flight: usize,
}

pub struct GibbsSampler<'a, S: MarkerSource> {
    config: ModelConfig,
    source: &'a S,
    markers: u32,
    family: FamilyModel,
    state: ModelState,
    dist: Distributions,
}

impl<'a, S: MarkerSource> GibbsSampler<'a, S> {
    /// Validates the configuration and inputs and draws the initial state.
    pub fn new(config: ModelConfig, source: &'a S, input: SamplerInput) -> Result<Self, SamplerError> {
        config.validate()?;
        let individuals = source.individuals();
        let markers = source.markers();
        if input.phenotype.len() != individuals {
            return Err(SamplerError::InputLength {
                what: "the phenotype",
                expected: individuals,
                found: input.phenotype.len(),
            });
        }
        let marker_count =
            u32::try_from(markers).map_err(|_| SamplerError::TooManyMarkers { markers })?;
        let covariates = Covariates::from_matrix(input.covariates.as_ref(), individuals)?;
        let mut dist = Distributions::new(config.seed);

        let (family, state) = match config.family {
            ModelFamily::Gaussian => {
                let (model, state) =
                    GaussianModel::init(&config, &input.phenotype, markers, covariates, &mut dist)?;
                (FamilyModel::Gaussian(model), state)
            }
            ModelFamily::Weibull => {
                let failure = input.failure.ok_or(SamplerError::MissingFailure)?;
                if failure.len() != individuals {
                    return Err(SamplerError::InputLength {
                        what: "the failure vector",
                        expected: individuals,
                        found: failure.len(),
                    });
                }
                if let Some((individual, &value)) = failure
                    .iter()
                    .enumerate()
                    .find(|&(_, &f)| f != 0.0 && f != 1.0)
                {
                    return Err(SamplerError::InvalidFailure { individual, value });
                }
                let (model, state) =
                    WeibullModel::init(&config, &input.phenotype, failure, markers, covariates)?;
                (FamilyModel::Weibull(model), state)
            }
        };

        log::info!(
            "Sampler ready: {} family, {} markers ({} store), {} individuals, {} covariates, {} mixture components.",
            match config.family {
                ModelFamily::Gaussian => "gaussian",
                ModelFamily::Weibull => "weibull",
            },
            markers,
            source.kind(),
            individuals,
            state.theta.len(),
            config.components()
        );
        log::info!(
            "Chain of {} iterations, burn-in {}, thinning {}, seed {}.",
            config.chain_length,
            config.burn_in,
            config.thinning,
            config.seed
        );

        Ok(Self {
            config,
            source,
            markers: marker_count,
            family,
            state,
            dist,
        })
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn layout(&self) -> SampleLayout {
        match &self.family {
            FamilyModel::Gaussian(m) => m.layout(&self.state, self.config.emit_residuals),
            FamilyModel::Weibull(m) => m.layout(&self.state),
        }
    }

    /// The current sample row, without the iteration number.
    pub fn sample(&self) -> Vec<f64> {
        match &self.family {
            FamilyModel::Gaussian(m) => m.row(&self.state, self.config.emit_residuals),
            FamilyModel::Weibull(m) => m.row(&self.state),
        }
    }

    /// Runs the whole chain, writing the retained samples to `sink`.
    pub fn run(&mut self, sink: &mut dyn SampleSink) -> Result<RunSummary, SamplerError> {
        sink.begin(&self.layout())?;
        let progress = create_progress_bar(self.config.chain_length as u64, "Sampling");
        let mut summary = RunSummary::default();

        for iteration in 0..self.config.chain_length {
            let started = Instant::now();
            let stats = self.iterate()?;
            summary.iterations += 1;
            summary.peak_in_flight = summary.peak_in_flight.max(stats.peak_in_flight);

            log::info!(
                "Iteration {iteration}: {} markers in the model, counts {:?}, {}, {:.3}s",
                self.state.included(),
                self.state.counts,
                self.hyperparameter_summary(),
                started.elapsed().as_secs_f64()
            );

            if self.config.is_retained(iteration) {
                sink.write_sample(&SampleRow {
                    iteration,
                    values: self.sample(),
                })?;
                summary.retained += 1;
            }
            progress.inc(1);
        }
        sink.finish()?;
        progress.finish_with_message("Chain complete");
        log::info!(
            "Finished {} iterations; {} samples retained.",
            summary.iterations,
            summary.retained
        );
        Ok(summary)
    }

    /// One full Gibbs iteration.
    pub fn iterate(&mut self) -> Result<SweepStats, SamplerError> {
        match &mut self.family {
            FamilyModel::Gaussian(m) => m.before_sweep(&mut self.state, &mut self.dist)?,
            FamilyModel::Weibull(m) => m.before_sweep(&mut self.state, &mut self.dist)?,
        }

        let stats = self.sweep()?;
        log::debug!(
            "Sweep: {} markers consumed, peak {} in flight, reorder depth {}.",
            stats.consumed,
            stats.peak_in_flight,
            stats.peak_reorder_depth
        );

        match &mut self.family {
            FamilyModel::Gaussian(m) => m.after_sweep(&mut self.state, &mut self.dist)?,
            FamilyModel::Weibull(m) => m.after_sweep(&mut self.state, &mut self.dist)?,
        }
        self.log_diagnostics();
        Ok(stats)
    }

    fn sweep(&mut self) -> Result<SweepStats, SamplerError> {
        let mut order: Vec<MarkerIndex> = (0..self.markers).map(MarkerIndex).collect();
        self.dist.shuffle(&mut order);

        let limits: PipelineLimits = self.config.pipeline.into();
        let source = self.source;
        let family = &mut self.family;
        let state = &mut self.state;
        let dist = &mut self.dist;
        match family {
            FamilyModel::Gaussian(m) => state.reset_sweep(m.count_seed()),
            FamilyModel::Weibull(m) => state.reset_sweep(m.count_seed()),
        }
        state.residual.resync();

        run_ordered(
            &order,
            limits,
            |index| source.build(index).map_err(SamplerError::from),
            |index, marker: Marker| {
                log::trace!("Updating {index} ({}).", marker.kind());
                match family {
                    FamilyModel::Gaussian(m) => m.update_marker(state, &marker, dist),
                    FamilyModel::Weibull(m) => m.update_marker(state, &marker, dist),
                }
            },
        )
    }

    fn hyperparameter_summary(&self) -> String {
        match &self.family {
            FamilyModel::Gaussian(m) => m.summary(),
            FamilyModel::Weibull(m) => m.summary(),
        }
    }

    fn log_diagnostics(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let r = &self.state.residual;
        log::debug!(
            "Diagnostics: mu {:.6}, residual mean {:.6e}, residual squared norm {:.6}, betasqn {:.6}, pi {:?}",
            self.state.mu,
            r.mean(),
            r.squared_norm(),
            self.state.betasqn,
            self.state.pi
        );
    }
}
