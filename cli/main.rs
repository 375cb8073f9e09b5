#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use bayesrr::config::{ModelConfig, ModelFamily};
use bayesrr::io::{MarkerStore, load_covariates, load_vector};
use bayesrr::prepare::{PreprocessOptions, preprocess};
use bayesrr::quadrature::QuadratureOrder;
use bayesrr::sampler::{GibbsSampler, SamplerInput};
use bayesrr::types::MarkerKind;
use bayesrr::writer::SampleWriter;

#[derive(Clone, Copy, ValueEnum)]
pub enum ModelFamilyCli {
    Gaussian,
    Weibull,
}

impl From<ModelFamilyCli> for ModelFamily {
    fn from(family: ModelFamilyCli) -> Self {
        match family {
            ModelFamilyCli::Gaussian => ModelFamily::Gaussian,
            ModelFamilyCli::Weibull => ModelFamily::Weibull,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StoreCli {
    Dense,
    SparseEigen,
    SparseRagged,
}

impl From<StoreCli> for MarkerKind {
    fn from(store: StoreCli) -> Self {
        match store {
            StoreCli::Dense => MarkerKind::Dense,
            StoreCli::SparseEigen => MarkerKind::SparseEigen,
            StoreCli::SparseRagged => MarkerKind::SparseRagged,
        }
    }
}

#[derive(Args)]
pub struct PreprocessArgs {
    /// Comma-separated dosage table: a header of marker names, one row per individual,
    /// values 0/1/2 with NA or an empty field for a missing call
    #[arg(long, value_name = "CSV")]
    pub genotypes: PathBuf,

    /// Output prefix; `.ppbed` (and `.ppbedindex`, `.sparsebed`, `.sparsebedindex`) are appended
    #[arg(long, value_name = "PREFIX")]
    pub out: PathBuf,

    /// zlib-compress every marker block
    #[arg(long)]
    pub compress: bool,

    /// Also write the sparse store
    #[arg(long)]
    pub sparse: bool,
}

#[derive(Args)]
pub struct RunArgs {
    /// Prefix of the preprocessed genotype store
    #[arg(long, value_name = "PREFIX")]
    pub data: PathBuf,

    /// Phenotype file, one value per line (the last whitespace-separated field is used).
    /// Log survival times for the weibull model.
    #[arg(long, value_name = "FILE")]
    pub pheno: PathBuf,

    /// TOML run configuration; flags given here take precedence over it
    #[arg(long, value_name = "TOML")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub model: Option<ModelFamilyCli>,

    /// Failure indicators (1 = event, 0 = censored), required by the weibull model
    #[arg(long, value_name = "FILE")]
    pub failure: Option<PathBuf>,

    /// Comma-separated covariate table with a header row
    #[arg(long, value_name = "CSV")]
    pub covariates: Option<PathBuf>,

    #[arg(long)]
    pub chain_length: Option<usize>,

    #[arg(long)]
    pub burn_in: Option<usize>,

    #[arg(long)]
    pub thin: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Variances of the non-null mixture components, e.g. 0.01,0.001,0.0001
    #[arg(long = "S", value_delimiter = ',', num_args = 1..)]
    pub mixture_variances: Option<Vec<f64>>,

    #[arg(long, value_enum)]
    pub store: Option<StoreCli>,

    /// The store was written with --compress
    #[arg(long)]
    pub compress: bool,

    /// Maximum number of markers decoded ahead of the sampler
    #[arg(long)]
    pub tokens: Option<usize>,

    /// Number of decoding workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Gauss-Hermite quadrature points for the weibull model: 3, 5, 7 or 11
    #[arg(long)]
    pub quad_points: Option<usize>,

    /// Leave the residual vector out of gaussian sample rows
    #[arg(long)]
    pub no_residuals: bool,

    /// Output CSV for the retained samples
    #[arg(long, default_value = "samples.csv")]
    pub samples: PathBuf,
}

impl RunArgs {
    /// Layers the explicit flags over `config`.
    fn apply(&self, config: &mut ModelConfig) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(model) = self.model {
            config.family = model.into();
        }
        if let Some(n) = self.chain_length {
            config.chain_length = n;
        }
        if let Some(n) = self.burn_in {
            config.burn_in = n;
        }
        if let Some(n) = self.thin {
            config.thinning = n;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(grid) = &self.mixture_variances {
            config.mixture_variances = grid.clone();
        }
        if let Some(store) = self.store {
            config.storage.kind = store.into();
        }
        if self.compress {
            config.storage.compressed = true;
        }
        if let Some(n) = self.tokens {
            config.pipeline.max_in_flight = n;
        }
        if let Some(n) = self.workers {
            config.pipeline.workers = n;
        }
        if let Some(points) = self.quad_points {
            config.quadrature_points = QuadratureOrder::try_from(points)?;
        }
        if self.no_residuals {
            config.emit_residuals = false;
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(
    name = "bayesrr",
    about = "Marker-wise Gibbs sampling for genome-wide Bayesian mixture regression"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Standardize a dosage table and write the marker stores
    #[command(about = "Preprocess genotypes (outputs: PREFIX.ppbed, PREFIX.sparsebed, ...)")]
    Preprocess(PreprocessArgs),

    /// Run the Gibbs sampler over a preprocessed store
    #[command(about = "Run the sampler (outputs: samples.csv)")]
    Run(RunArgs),
}

fn run_preprocess(args: PreprocessArgs) -> Result<(), Box<dyn std::error::Error>> {
    let options = PreprocessOptions {
        compressed: args.compress,
        sparse: args.sparse,
    };
    let summary = preprocess(&args.genotypes, &args.out, options)?;
    for path in &summary.written {
        log::info!("Wrote {}", path.display());
    }
    Ok(())
}

fn run_sampler(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ModelConfig::from_toml_file(path)?,
        None => ModelConfig::default(),
    };
    args.apply(&mut config)?;
    config.validate()?;
    log::debug!("Effective configuration:\n{}", config.to_toml_string()?);

    let phenotype = load_vector(&args.pheno)?;
    let failure = args.failure.as_deref().map(load_vector).transpose()?;
    let covariates = match args.covariates.as_deref() {
        Some(path) => {
            let (names, matrix) = load_covariates(path)?;
            log::info!("Loaded {} covariates: {}", names.len(), names.join(", "));
            Some(matrix)
        }
        None => None,
    };

    let store = MarkerStore::open(
        &args.data,
        phenotype.len(),
        config.storage.kind,
        config.storage.compressed,
    )?;
    let input = SamplerInput {
        phenotype,
        failure,
        covariates,
    };

    let mut sampler = GibbsSampler::new(config, &store, input)?;
    let mut sink = SampleWriter::create(&args.samples)?;
    let summary = sampler.run(&mut sink)?;
    log::info!(
        "Wrote {} samples to {} (peak {} markers in flight).",
        summary.retained,
        args.samples.display(),
        summary.peak_in_flight
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Preprocess(args)) => run_preprocess(args),
        Some(Commands::Run(args)) => run_sampler(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("{e}");
        process::exit(1);
    }
}
