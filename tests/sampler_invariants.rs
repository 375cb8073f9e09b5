use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp1, Normal};
use rand_pcg::Pcg64;
use std::fs;
use tempfile::tempdir;

use bayesrr::config::{ConfigError, ModelConfig, ModelFamily, PipelineSettings};
use bayesrr::io::{InMemoryStore, MarkerSource, StoreError};
use bayesrr::marker::Marker;
use bayesrr::prepare::{GenotypeMatrix, standardize};
use bayesrr::quadrature::QuadratureOrder;
use bayesrr::sampler::{GibbsSampler, SamplerError, SamplerInput};
use bayesrr::types::{MarkerIndex, MarkerKind};
use bayesrr::writer::{SampleBuffer, SampleWriter};

const EULER_GAMMA: f64 = 0.577215664901532;

struct Simulated {
    matrix: GenotypeMatrix,
    phenotype: Vec<f64>,
    covariates: Array2<f64>,
}

fn simulate(individuals: usize, markers: usize, seed: u64) -> Simulated {
    let mut rng = Pcg64::seed_from_u64(seed);
    let columns: Vec<Vec<Option<u8>>> = (0..markers)
        .map(|_| {
            let p: f64 = rng.gen_range(0.1..0.5);
            (0..individuals)
                .map(|_| {
                    if rng.gen_bool(0.01) {
                        None
                    } else {
                        Some(u8::from(rng.gen_bool(p)) + u8::from(rng.gen_bool(p)))
                    }
                })
                .collect()
        })
        .collect();
    let signal: Vec<f64> = standardize(&columns[0])
        .values
        .iter()
        .zip(&standardize(&columns[1]).values)
        .map(|(a, b)| 0.6 * a - 0.4 * b)
        .collect();
    let noise = Normal::new(0.0, 0.5).unwrap();
    let covariates = Array2::from_shape_fn((individuals, 1), |(i, _)| if i % 3 == 0 { 1.0 } else { 0.0 });
    let phenotype = signal
        .iter()
        .enumerate()
        .map(|(i, s)| s + 0.3 * covariates[[i, 0]] + noise.sample(&mut rng))
        .collect();
    Simulated {
        matrix: GenotypeMatrix::from_columns(individuals, columns).unwrap(),
        phenotype,
        covariates,
    }
}

fn gaussian_config(workers: usize) -> ModelConfig {
    ModelConfig {
        chain_length: 30,
        burn_in: 10,
        thinning: 2,
        seed: 7,
        pipeline: PipelineSettings {
            max_in_flight: 5,
            workers,
        },
        ..ModelConfig::default()
    }
}

fn standardized(phenotype: &[f64]) -> Vec<f64> {
    let n = phenotype.len() as f64;
    let mean = phenotype.iter().sum::<f64>() / n;
    let sd = (phenotype.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
    phenotype.iter().map(|y| (y - mean) / sd).collect()
}

#[test]
fn gaussian_sweeps_keep_the_state_consistent() {
    let sim = simulate(120, 25, 11);
    let store = InMemoryStore::new(&sim.matrix, MarkerKind::SparseEigen, false).unwrap();
    let columns: Vec<Vec<f64>> = (0..25)
        .map(|j| store.build(MarkerIndex(j)).unwrap().to_dense())
        .collect();
    let config = gaussian_config(3);
    let cva = config.component_variances();
    let input = SamplerInput {
        phenotype: sim.phenotype.clone(),
        covariates: Some(sim.covariates.clone()),
        ..SamplerInput::default()
    };
    let mut sampler = GibbsSampler::new(config, &store, input).unwrap();
    let y = standardized(&sim.phenotype);

    for _ in 0..15 {
        sampler.iterate().unwrap();
        let state = sampler.state();

        assert_relative_eq!(
            state.betasqn,
            state.recomputed_betasqn(&cva),
            max_relative = 1e-9,
            epsilon = 1e-12
        );
        assert_eq!(state.counts.iter().sum::<usize>(), 25);
        assert_relative_eq!(state.pi.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        for (&c, &b) in state.components.iter().zip(&state.beta) {
            assert_eq!(c == 0, b == 0.0);
        }

        for (i, &e) in state.residual.values().iter().enumerate() {
            let fitted: f64 = state.mu
                + state.theta[0] * sim.covariates[[i, 0]]
                + columns
                    .iter()
                    .zip(&state.beta)
                    .map(|(x, b)| b * x[i])
                    .sum::<f64>();
            assert_abs_diff_eq!(e, y[i] - fitted, epsilon = 1e-9);
        }
        assert_relative_eq!(
            state.residual.sum(),
            state.residual.values().iter().sum::<f64>(),
            epsilon = 1e-9
        );
    }
}

#[test]
fn chains_do_not_depend_on_the_number_of_workers() {
    let sim = simulate(80, 12, 5);
    let store = InMemoryStore::new(&sim.matrix, MarkerKind::Dense, true).unwrap();
    let run = |workers| {
        let input = SamplerInput {
            phenotype: sim.phenotype.clone(),
            ..SamplerInput::default()
        };
        let mut sampler = GibbsSampler::new(gaussian_config(workers), &store, input).unwrap();
        let mut buffer = SampleBuffer::new();
        sampler.run(&mut buffer).unwrap();
        buffer.rows().to_vec()
    };
    let single = run(1);
    assert_eq!(single.len(), 10);
    assert_eq!(single, run(4));
}

#[test]
fn samples_are_written_as_csv() {
    let sim = simulate(40, 6, 2);
    let store = InMemoryStore::new(&sim.matrix, MarkerKind::Dense, false).unwrap();
    let config = ModelConfig {
        emit_residuals: false,
        ..gaussian_config(2)
    };
    let input = SamplerInput {
        phenotype: sim.phenotype,
        ..SamplerInput::default()
    };
    let dir = tempdir().unwrap();
    let path = dir.path().join("samples.csv");
    let mut sampler = GibbsSampler::new(config, &store, input).unwrap();
    let mut writer = SampleWriter::create(&path).unwrap();
    sampler.run(&mut writer).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 11);
    assert!(lines[0].starts_with("iteration,mu,beta[1],"));
    assert!(lines[0].ends_with("sigmaE,sigmaG,comp[1],comp[2],comp[3],comp[4],comp[5],comp[6]"));
    assert!(lines[1].starts_with("10,"));
    assert!(lines[10].starts_with("28,"));
    assert_eq!(lines[1].split(',').count(), 1 + 1 + 6 + 2 + 6);
}

struct SurvivalData {
    matrix: GenotypeMatrix,
    log_times: Vec<f64>,
    failure: Vec<f64>,
    covariates: Array2<f64>,
}

/// Log survival times with one causal marker, a binary and a continuous covariate,
/// and roughly 20% censoring.
fn weibull_data(individuals: usize, markers: usize) -> SurvivalData {
    let sim = simulate(individuals, markers, 21);
    let mut rng = Pcg64::seed_from_u64(22);
    let x = standardize(&sim.matrix.columns()[0]).values;
    let covariates = Array2::from_shape_fn((individuals, 2), |(i, f)| match f {
        0 => sim.covariates[[i, 0]],
        _ => (i as f64 * 0.37).sin(),
    });
    let alpha = 2.0;
    let log_times = x
        .iter()
        .enumerate()
        .map(|(i, xi)| {
            let e: f64 = Exp1.sample(&mut rng);
            1.0 + 0.3 * xi
                + 0.4 * covariates[[i, 0]]
                - 0.2 * covariates[[i, 1]]
                + (e.ln() + EULER_GAMMA) / alpha
        })
        .collect();
    let failure = (0..individuals)
        .map(|_| if rng.gen_bool(0.8) { 1.0 } else { 0.0 })
        .collect();
    SurvivalData {
        matrix: sim.matrix,
        log_times,
        failure,
        covariates,
    }
}

#[test]
fn weibull_chain_runs_and_keeps_its_invariants() {
    let data = weibull_data(150, 15);
    for kind in [MarkerKind::Dense, MarkerKind::SparseEigen, MarkerKind::SparseRagged] {
        let store = InMemoryStore::new(&data.matrix, kind, true).unwrap();
        let columns: Vec<Vec<f64>> = (0..15)
            .map(|j| store.build(MarkerIndex(j)).unwrap().to_dense())
            .collect();
        let config = ModelConfig {
            family: ModelFamily::Weibull,
            chain_length: 25,
            burn_in: 5,
            thinning: 5,
            seed: 3,
            quadrature_points: QuadratureOrder::Eleven,
            ..ModelConfig::default()
        };
        let cva = config.component_variances();
        let components = config.components();
        let input = SamplerInput {
            phenotype: data.log_times.clone(),
            failure: Some(data.failure.clone()),
            covariates: Some(data.covariates.clone()),
        };
        let mut sampler = GibbsSampler::new(config, &store, input).unwrap();
        for _ in 0..10 {
            sampler.iterate().unwrap();
            let state = sampler.state();
            assert_eq!(state.counts.iter().sum::<usize>(), 15 + components);
            assert_relative_eq!(
                state.betasqn,
                state.recomputed_betasqn(&cva),
                max_relative = 1e-9,
                epsilon = 1e-12
            );
            assert!(state.residual.values().iter().all(|e| e.is_finite()));
        }

        let mut buffer = SampleBuffer::new();
        let summary = sampler.run(&mut buffer).unwrap();
        assert_eq!(summary.retained, 4);
        let alpha = buffer.column("alpha").unwrap();
        assert!(alpha.iter().all(|&a| a.is_finite() && a > 0.0));
        let sigma_b = buffer.column("sigmaB").unwrap();
        assert!(sigma_b.iter().all(|&s| s.is_finite() && s > 0.0));
        for name in ["theta[1]", "theta[2]"] {
            let theta = buffer.column(name).unwrap();
            assert!(theta.iter().all(|t| t.is_finite()), "{kind}: {name} {theta:?}");
        }

        // The residual is the log time minus every fitted term.
        let state = sampler.state();
        assert_eq!(state.theta.len(), 2);
        for (i, &e) in state.residual.values().iter().enumerate() {
            let fitted = state.mu
                + state.theta[0] * data.covariates[[i, 0]]
                + state.theta[1] * data.covariates[[i, 1]]
                + columns
                    .iter()
                    .zip(&state.beta)
                    .map(|(x, b)| b * x[i])
                    .sum::<f64>();
            assert_abs_diff_eq!(e, data.log_times[i] - fitted, epsilon = 1e-9);
        }
    }
}

#[test]
fn weibull_requires_failure_indicators() {
    let SurvivalData {
        matrix,
        log_times,
        mut failure,
        ..
    } = weibull_data(30, 3);
    let store = InMemoryStore::new(&matrix, MarkerKind::Dense, false).unwrap();
    let config = ModelConfig {
        family: ModelFamily::Weibull,
        ..ModelConfig::default()
    };
    let missing = SamplerInput {
        phenotype: log_times.clone(),
        ..SamplerInput::default()
    };
    assert!(matches!(
        GibbsSampler::new(config.clone(), &store, missing),
        Err(SamplerError::MissingFailure)
    ));

    failure[4] = 2.0;
    let invalid = SamplerInput {
        phenotype: log_times,
        failure: Some(failure),
        covariates: None,
    };
    assert!(matches!(
        GibbsSampler::new(config, &store, invalid),
        Err(SamplerError::InvalidFailure {
            individual: 4,
            ..
        })
    ));
}

#[test]
fn invalid_configuration_fails_before_sampling() {
    let sim = simulate(20, 2, 1);
    let store = InMemoryStore::new(&sim.matrix, MarkerKind::Dense, false).unwrap();
    let config = ModelConfig {
        chain_length: 10,
        burn_in: 10,
        ..ModelConfig::default()
    };
    let input = SamplerInput {
        phenotype: sim.phenotype,
        ..SamplerInput::default()
    };
    assert!(matches!(
        GibbsSampler::new(config, &store, input),
        Err(SamplerError::Config(ConfigError::BurnInTooLong { .. }))
    ));
}

#[test]
fn phenotype_length_must_match_the_store() {
    let sim = simulate(20, 2, 1);
    let store = InMemoryStore::new(&sim.matrix, MarkerKind::Dense, false).unwrap();
    let input = SamplerInput {
        phenotype: vec![1.0; 19],
        ..SamplerInput::default()
    };
    assert!(matches!(
        GibbsSampler::new(ModelConfig::default(), &store, input),
        Err(SamplerError::InputLength {
            expected: 20,
            found: 19,
            ..
        })
    ));
}

/// Reports more markers than sweep indices can address; nothing is ever built.
struct OversizedSource;

impl MarkerSource for OversizedSource {
    fn individuals(&self) -> usize {
        4
    }

    fn markers(&self) -> usize {
        u32::MAX as usize + 1
    }

    fn kind(&self) -> MarkerKind {
        MarkerKind::Dense
    }

    fn build(&self, marker: MarkerIndex) -> Result<Marker, StoreError> {
        Err(StoreError::OutOfRange {
            marker,
            markers: self.markers(),
        })
    }
}

#[test]
fn marker_count_must_fit_a_marker_index() {
    let input = SamplerInput {
        phenotype: vec![0.5, 1.0, -0.3, 2.0],
        ..SamplerInput::default()
    };
    assert!(matches!(
        GibbsSampler::new(ModelConfig::default(), &OversizedSource, input),
        Err(SamplerError::TooManyMarkers { markers }) if markers == u32::MAX as usize + 1
    ));
}
