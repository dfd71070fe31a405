use lentil::backend::ComputeBackend;
use lentil::node::NodeKind;
use lentil::options::{ConvergenceMode, DropOptions, TrainOptions};
use lentil::simulate::*;
use lentil::{BayesNet, ModelBuilder, StochasticBayesNet};

use clap::{Args, Parser, Subcommand};
use log::info;
use matrix_util::common_io::{mkdir, read_lines, write_lines};
use matrix_util::traits::IoOps;
use std::collections::HashMap;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Variational inference for multi-view factor analysis.\n\
		  Data files are tab-separated matrices (samples x features),\n\
		  one file per view, with `NA` or `NaN` marking missing values."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Simulate multi-view factor data",
        long_about = "Simulate multi-view data from a linear factor model\n\
		      with Gaussian noise, inactive factors and missing values."
    )]
    Simulate(SimulateArgs),

    #[command(
        about = "Fit a multi-view factor model",
        long_about = "Fit a Bayesian multi-view factor model by coordinate ascent\n\
		      variational inference, optionally with stochastic mini-batches.\n\
		      Outputs:\n\
		      - {out}.elbo.tsv: ELBO terms of every checkpoint\n\
		      - {out}.stats.tsv: time, factors and ELBO of every iteration\n\
		      - {out}.factors.tsv.gz: posterior mean of the factors\n\
		      - {out}.loadings{m}.tsv.gz: posterior mean of the loadings\n\
		      - {out}.r2.tsv: variance explained by group, view and factor\n"
    )]
    Fit(FitArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long, short, required = true, help = "Output header")]
    out: Box<str>,

    #[arg(long, default_value_t = 100, help = "Number of samples")]
    rows: usize,

    #[arg(
        long,
        value_delimiter(','),
        default_values_t = vec![50, 50],
        help = "Number of features in each view",
        long_help = "Number of features in each view (comma-separated).\n\
		     Example: 100,30,50"
    )]
    features: Vec<usize>,

    #[arg(long, short = 'k', default_value_t = 5, help = "Number of factors")]
    factors: usize,

    #[arg(long, default_value_t = 1, help = "Number of sample groups")]
    groups: usize,

    #[arg(long, default_value_t = 0.5, help = "Noise standard deviation")]
    noise_sd: f64,

    #[arg(
        long,
        default_value_t = 1.0,
        help = "Probability that a factor is active in a view"
    )]
    active: f64,

    #[arg(long, default_value_t = 0.0, help = "Fraction of missing entries")]
    missing: f64,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    rseed: u64,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

#[derive(Args, Debug)]
struct FitArgs {
    #[arg(
        required = true,
        help = "Data files, one per view",
        long_help = "Data files, one per view.\n\
		     Each file is a samples x features matrix;\n\
		     every file must have the same samples in the same order."
    )]
    data_files: Vec<Box<str>>,

    #[arg(long, short, required = true, help = "Output header")]
    out: Box<str>,

    #[arg(
        long,
        short = 'g',
        help = "Group membership file",
        long_help = "Group membership file with one label per line,\n\
		     one line per sample. All samples form one group if omitted."
    )]
    group_file: Option<Box<str>>,

    #[arg(long, short = 'k', default_value_t = 10, help = "Number of factors")]
    factors: usize,

    #[arg(
        long,
        help = "Training options (JSON)",
        long_help = "Training options in a JSON file.\n\
		     When given, it replaces every training option below."
    )]
    options: Option<Box<str>>,

    #[arg(long, default_value_t = 1000, help = "Maximum number of iterations")]
    maxiter: usize,

    #[arg(long, value_enum, default_value = "fast", help = "Convergence criterion")]
    convergence_mode: ConvergenceMode,

    #[arg(long, help = "Run all iterations regardless of convergence")]
    forceiter: bool,

    #[arg(
        long,
        help = "Drop factors explaining at most this much variance",
        long_help = "Drop a factor once it explains at most this fraction of variance\n\
		     in every view of every group. One factor at a time."
    )]
    min_r2: Option<f64>,

    #[arg(long, default_value_t = 1, help = "First iteration to drop factors")]
    start_drop: usize,

    #[arg(long, default_value_t = 1, help = "Drop factors every this many iterations")]
    freq_drop: usize,

    #[arg(long, default_value_t = 1, help = "First iteration to update sparsity")]
    start_sparsity: usize,

    #[arg(long, default_value_t = 1, help = "First iteration to evaluate the ELBO")]
    start_elbo: usize,

    #[arg(long, default_value_t = 1, help = "Evaluate the ELBO every this many iterations")]
    elbofreq: usize,

    #[arg(long, help = "Stochastic variational inference")]
    stochastic: bool,

    #[arg(long, default_value_t = 0.5, help = "Mini-batch size as a fraction of samples")]
    batch_size: f64,

    #[arg(long, default_value_t = 1.0, help = "Learning rate of the step size")]
    learning_rate: f64,

    #[arg(long, default_value_t = 0.5, help = "Forgetting rate of the step size")]
    forgetting_rate: f64,

    #[arg(long, default_value_t = 1, help = "First stochastic iteration")]
    start_stochastic: usize,

    #[arg(long, help = "Use candle tensors (cuda if available)")]
    gpu: bool,

    #[arg(long, help = "Keep features uncentred")]
    no_centre: bool,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,

    #[arg(long, short, help = "No progress messages")]
    quiet: bool,
}

impl FitArgs {
    fn train_options(&self) -> anyhow::Result<TrainOptions> {
        if let Some(file) = &self.options {
            return TrainOptions::from_json_file(file);
        }
        let ret = TrainOptions {
            maxiter: self.maxiter,
            start_drop: self.start_drop,
            freq_drop: self.freq_drop,
            verbose: self.verbose,
            quiet: self.quiet,
            convergence_mode: self.convergence_mode,
            forceiter: self.forceiter,
            schedule: vec![
                NodeKind::Y,
                NodeKind::W,
                NodeKind::Z,
                NodeKind::AlphaW,
                NodeKind::ThetaW,
                NodeKind::Tau,
            ],
            start_sparsity: self.start_sparsity,
            gpu_mode: self.gpu,
            start_elbo: self.start_elbo,
            elbofreq: self.elbofreq,
            drop: DropOptions {
                min_r2: self.min_r2,
            },
            stochastic: self.stochastic,
            batch_size: Some(self.batch_size),
            learning_rate: Some(self.learning_rate),
            forgetting_rate: Some(self.forgetting_rate),
            start_stochastic: Some(self.start_stochastic),
            seed: self.seed,
            ..Default::default()
        };
        ret.validate()?;
        Ok(ret)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Simulate(args) => {
            init_logger(args.verbose);
            run_simulate(args)?;
        }
        Commands::Fit(args) => {
            init_logger(args.verbose || !args.quiet);
            run_fit(args)?;
        }
    }

    info!("Done");
    Ok(())
}

fn init_logger(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}

fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    mkdir(&args.out)?;
    let sim_args = SimArgs {
        rows: args.rows,
        features: args.features.clone(),
        factors: args.factors,
        groups: args.groups,
        noise_sd: args.noise_sd,
        active: args.active,
        missing: args.missing,
        rseed: args.rseed,
    };
    generate_factor_data_files(&sim_args, &args.out)?;
    Ok(())
}

/// Map group labels to `0..G` in order of first appearance
fn read_groups(group_file: &str, nn: usize) -> anyhow::Result<Vec<usize>> {
    let labels = read_lines(group_file)?;
    if labels.len() != nn {
        anyhow::bail!("{} group labels for {} samples", labels.len(), nn);
    }
    let mut index: HashMap<Box<str>, usize> = HashMap::new();
    Ok(labels
        .into_iter()
        .map(|x| {
            let next = index.len();
            *index.entry(x).or_insert(next)
        })
        .collect())
}

fn run_fit(args: &FitArgs) -> anyhow::Result<()> {
    let options = args.train_options()?;
    mkdir(&args.out)?;

    let mut views = Vec::with_capacity(args.data_files.len());
    for file in args.data_files.iter() {
        let y = ndarray::Array2::<f64>::from_tsv(file, None)?;
        info!("{}: {} x {}", file, y.nrows(), y.ncols());
        views.push(y);
    }
    let nn = views.first().map(|y| y.nrows()).unwrap_or(0);

    let backend = ComputeBackend::from_gpu_mode(options.gpu_mode)?;
    info!("backend: {}", backend.name());

    let mut builder = ModelBuilder::new(views, args.factors)
        .backend(backend)
        .seed(args.seed)
        .centre(!args.no_centre);
    if let Some(group_file) = &args.group_file {
        builder = builder.groups(read_groups(group_file, nn)?);
    }
    let mut net = builder.build()?;

    let net = if options.stochastic {
        let mut svi = StochasticBayesNet::new(net);
        svi.set_train_options(options)?;
        svi.iterate()?;
        svi.into_inner()
    } else {
        net.set_train_options(options)?;
        net.iterate()?;
        net
    };

    write_results(&net, &args.out)
}

fn write_results(net: &BayesNet, out: &str) -> anyhow::Result<()> {
    let stats = net
        .training_stats()
        .ok_or_else(|| anyhow::anyhow!("model has not been trained"))?;

    write_lines(&stats.ledger.to_lines(), &format!("{}.elbo.tsv", out))?;

    let mut lines = vec![Box::from("iter\ttime\tfactors\telbo")];
    for (i, ((t, k), e)) in stats
        .time
        .iter()
        .zip(stats.number_factors.iter())
        .zip(stats.elbo.iter())
        .enumerate()
    {
        lines.push(format!("{}\t{}\t{}\t{}", i, t, k, e).into_boxed_str());
    }
    write_lines(&lines, &format!("{}.stats.tsv", out))?;

    let z = net.expectation_of(NodeKind::Z)?;
    z[0].to_tsv(&format!("{}.factors.tsv.gz", out))?;

    for (m, w_m) in net.expectation_of(NodeKind::W)?.iter().enumerate() {
        w_m.to_tsv(&format!("{}.loadings{}.tsv.gz", out, m))?;
    }

    let mut lines = vec![Box::from("group\tview\tfactor\tr2")];
    for (g, r2_g) in net.calculate_variance_explained()?.iter().enumerate() {
        for ((m, k), r2) in r2_g.indexed_iter() {
            lines.push(format!("{}\t{}\t{}\t{}", g, m, k, r2).into_boxed_str());
        }
    }
    for (m, r2) in net.calculate_total_variance_explained()?.iter().enumerate() {
        lines.push(format!("all\t{}\tall\t{}", m, r2).into_boxed_str());
    }
    write_lines(&lines, &format!("{}.r2.tsv", out))?;

    info!(
        "{} factors after {} iterations{}",
        net.dims().k,
        stats.time.len() - 1,
        if stats.converged { " (converged)" } else { "" }
    );
    Ok(())
}
