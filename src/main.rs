// ========================================================================================
//
//                          The Command-Line Front End: lfs
//
// ========================================================================================
//
// `lfs run` loads a delimited table, builds the engine from the config file plus any
// flags, runs the requested passes and writes the per-row selections next to a
// per-variable frequency summary. `lfs synth` writes a synthetic table for trying the
// engine out, and `lfs init-config` writes the default configuration.

use clap::{Args, Parser, Subcommand};
use lfs::data::{self, ReadOptions, SyntheticSpec};
use lfs::progress::ProgressBarObserver;
use lfs::{Lfs, LfsConfig, SolverKind, WeightBackend};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "lfs",
    version,
    about = "Local feature selection: a per-case subset of variables that separates each case's class."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run local feature selection on a data file
    Run(RunArgs),

    /// Write a synthetic dataset with class-shifted informative variables
    Synth(SynthArgs),

    /// Write the default configuration as TOML
    InitConfig {
        /// Destination of the config file
        #[arg(default_value = "lfs.toml")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Delimited text file with a header row (tab, comma or whitespace separated)
    input: PathBuf,

    /// Where to write the selection matrix (TSV)
    #[arg(short, long, default_value = "selections.tsv")]
    output: PathBuf,

    /// TOML config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Feature columns to use (default: every column except the class column)
    #[arg(long, value_delimiter = ',')]
    features: Option<Vec<String>>,

    /// Class column (default: the last column)
    #[arg(long)]
    class_column: Option<String>,

    /// First data row to use, 0-based
    #[arg(long, default_value_t = 0)]
    start_row: usize,

    /// One past the last data row to use
    #[arg(long)]
    end_row: Option<usize>,

    #[arg(long)]
    max_kept: Option<usize>,

    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    iterations: Option<usize>,

    /// Accepted Monte-Carlo samples per beta trial
    #[arg(long)]
    n_rand: Option<usize>,

    /// Beta trials per case
    #[arg(long)]
    n_beta: Option<usize>,

    #[arg(long, value_enum)]
    solver: Option<SolverKind>,

    /// Where weights are computed from the second iteration on
    #[arg(long, value_enum)]
    weights: Option<WeightBackend>,

    /// Single worker thread and CPU weights
    #[arg(long)]
    deterministic: bool,

    /// Log every case outcome
    #[arg(short, long)]
    verbose: bool,

    /// Do not draw a progress bar
    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct SynthArgs {
    /// Destination file (TSV)
    output: PathBuf,

    #[arg(long, default_value_t = 200)]
    cases: usize,

    #[arg(long, default_value_t = 20)]
    vars: usize,

    /// Leading variables whose mean depends on the class
    #[arg(long, default_value_t = 3)]
    informative: usize,

    #[arg(long, default_value_t = 2)]
    classes: usize,

    /// Class mean shift on informative variables, in noise standard deviations
    #[arg(long, default_value_t = 2.0)]
    shift: f64,

    /// Generator seed (default: drawn at random)
    #[arg(long)]
    seed: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Synth(args) => synth(args),
        Commands::InitConfig { path } => init_config(&path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn resolve_config(args: &RunArgs) -> Result<LfsConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => LfsConfig::load(path)?,
        None => LfsConfig::default(),
    };
    if let Some(v) = args.max_kept {
        config.max_kept = v;
    }
    if let Some(v) = args.threads {
        config.max_threads = v;
    }
    if let Some(v) = args.iterations {
        config.iterations = v;
    }
    if let Some(v) = args.n_rand {
        config.n_rand = v;
    }
    if let Some(v) = args.n_beta {
        config.n_beta = v;
    }
    if let Some(v) = args.solver {
        config.solver = v;
    }
    if let Some(v) = args.weights {
        config.weights = v;
    }
    config.deterministic |= args.deterministic;
    config.verbose |= args.verbose;
    config.validate()?;
    Ok(config)
}

/// `selections.tsv` becomes `selections.frequency.tsv`.
fn frequency_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "selections".to_string());
    output.with_file_name(format!("{stem}.frequency.tsv"))
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let config = resolve_config(&args)?;

    // --- 1. Load ---
    let options = ReadOptions {
        features: args.features.clone(),
        class_column: args.class_column.clone(),
        start_row: args.start_row,
        end_row: args.end_row,
    };
    let dataset = data::read_dataset(&args.input, &options)?;
    dataset.log_summary();

    // --- 2. Build and run ---
    let mut engine = Lfs::with_options(dataset.engine_matrix().view(), config.engine_options())?;
    let summary = if args.quiet {
        engine.run(config.iterations, config.n_rand, config.n_beta, 0, 1)?
    } else {
        let observer = ProgressBarObserver::new();
        engine.run_observed(
            config.iterations,
            config.n_rand,
            config.n_beta,
            0,
            1,
            &observer,
        )?
    };

    // --- 3. Write ---
    data::write_selections(&args.output, &dataset, engine.get_f())?;
    let freq_path = frequency_path(&args.output);
    data::write_frequency_summary(&freq_path, &dataset.feature_names, &summary.selection_frequency)?;

    if let Some(last) = summary.final_iteration() {
        println!(
            "{} rows: {} optimal, {} fallback, {} failed.",
            dataset.n_rows(),
            last.optimal,
            last.fallback,
            last.failed
        );
    }
    println!(
        "Selections written to {} and {} in {:.2?}.",
        args.output.display(),
        freq_path.display(),
        start.elapsed()
    );
    Ok(())
}

fn synth(args: SynthArgs) -> Result<(), Box<dyn Error>> {
    let spec = SyntheticSpec {
        n_cases: args.cases,
        n_vars: args.vars,
        n_informative: args.informative,
        n_classes: args.classes,
        shift: args.shift,
    };
    let dataset = data::synthetic_dataset(&spec, args.seed)?;
    data::write_dataset(&args.output, &dataset)?;
    println!(
        "Wrote {} cases x {} variables ({} informative) to {}.",
        spec.n_cases,
        spec.n_vars,
        spec.n_informative,
        args.output.display()
    );
    Ok(())
}

fn init_config(path: &Path) -> Result<(), Box<dyn Error>> {
    LfsConfig::default().save(path)?;
    println!("Default configuration written to {}.", path.display());
    Ok(())
}
