#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use damds::io::{read_labels, write_points};
use damds::timing::NoopObserver;
use damds::{InputSet, SolverConfig, run_local};
use log::info;
use std::path::PathBuf;
use std::process;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the TOML run configuration
    pub config: PathBuf,

    /// Number of simulated processes (overrides process_count)
    #[arg(long, value_name = "P")]
    pub processes: Option<usize>,

    /// Worker threads per process (overrides threads_per_process)
    #[arg(long, value_name = "K")]
    pub threads: Option<usize>,

    /// Processes sharing one node region (overrides procs_per_node)
    #[arg(long, value_name = "N")]
    pub procs_per_node: Option<usize>,

    /// Map node regions from files in this directory (overrides shared_region_dir)
    #[arg(long, value_name = "DIR")]
    pub region_dir: Option<PathBuf>,

    /// Use every logical core, split evenly across the processes
    #[arg(long, conflicts_with = "threads")]
    pub all_cores: bool,

    /// Where to write the final points (overrides points_file)
    #[arg(long, short = 'o', value_name = "FILE")]
    pub points: Option<PathBuf>,

    /// Seed of the random initial mapping (overrides seed)
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args)]
pub struct TemplateArgs {
    /// Number of points in the distance matrix
    #[arg(long, value_name = "N")]
    pub points: usize,

    /// Target dimension of the embedding
    #[arg(long, default_value = "3")]
    pub dim: usize,

    /// Distance matrix file to reference in the template
    #[arg(long)]
    pub distances: Option<PathBuf>,

    /// Output path of the template
    #[arg(long, short = 'o', default_value = "damds.toml")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "damds",
    about = "Deterministic-annealing SMACOF on a hybrid process/thread layout",
    long_about = "Embeds an N x N dissimilarity matrix into a low-dimensional space by \
                 majorizing weighted stress under a cooling temperature schedule."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a configured embedding (outputs: points file)")]
    Run(RunArgs),
    #[command(about = "Write a configuration template with every default filled in")]
    Template(TemplateArgs),
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Template(args)) => template(args),
        Some(Commands::Version) => {
            println!("damds {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SolverConfig::load(&args.config)?;
    if let Some(processes) = args.processes {
        config.process_count = processes;
    }
    if let Some(per_node) = args.procs_per_node {
        config.procs_per_node = per_node;
    }
    if let Some(threads) = args.threads {
        config.threads_per_process = threads;
    }
    if let Some(dir) = args.region_dir {
        config.shared_region_dir = Some(dir);
    }
    if args.all_cores {
        config.threads_per_process = (num_cpus::get() / config.process_count.max(1)).max(1);
    }
    if let Some(points) = args.points {
        config.points_file = Some(points);
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate()?;

    let inputs = InputSet::from_config(&config)?;
    let outcome = run_local(&config, &inputs, &mut NoopObserver)?;

    match &config.points_file {
        Some(path) => {
            let labels = config.label_file.as_deref().map(read_labels).transpose()?;
            write_points(path, &outcome.points, labels.as_ref())?;
            info!("Wrote {} points to {}", outcome.points.nrows(), path.display());
        }
        None => info!("No points file configured; the embedding was not written"),
    }
    println!(
        "Final stress {:.10} after {} temperature loops ({} SMACOF iterations)",
        outcome.final_stress, outcome.temperature_loops, outcome.smacof_iterations
    );
    Ok(())
}

fn template(args: TemplateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SolverConfig::new(args.points, args.dim);
    config.distance_matrix_file = args.distances;
    config.validate()?;
    config.save(&args.output)?;
    println!("Wrote configuration template to {}", args.output.display());
    Ok(())
}
