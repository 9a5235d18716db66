// ========================================================================================
//
//                              THE COMMAND LINE: GROVE
//
// ========================================================================================
//
// Thin front end over the library pipeline. It parses arguments, applies flag
// overrides on top of the TOML configuration, runs the analysis and prints the
// diagnostics. All statistical work lives in the library.

use clap::{CommandFactory, Parser, Subcommand};
use grove::config::RunConfig;
use grove::run::run;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "grove",
    version,
    about = "Heterogeneous treatment effect analysis with honest causal forests."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an analysis described by a TOML configuration file
    #[command(about = "Fit a causal forest and write diagnostics (outputs: predictions.tsv, summary.toml, ...)")]
    Run {
        /// Path to the run configuration (.toml)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Override the dataset path from the configuration
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,

        /// Override the output directory from the configuration
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Override the number of trees in the causal forest
        #[arg(long, value_name = "N")]
        num_trees: Option<usize>,

        /// Override the random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Tune forest parameters before the final fit
        #[arg(long)]
        tune: bool,
    },

    /// Write a configuration file with every default filled in
    #[command(about = "Write a default configuration file")]
    InitConfig {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn run_analysis(
    config_path: PathBuf,
    input: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    num_trees: Option<usize>,
    seed: Option<u64>,
    tune: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading configuration from: {}", config_path.display());
    let mut config = RunConfig::load(&config_path)?;
    if let Some(input) = input {
        config.input = input;
    }
    if let Some(output_dir) = output_dir {
        config.output_dir = output_dir;
    }
    if let Some(num_trees) = num_trees {
        config.forest.num_trees = num_trees;
    }
    if let Some(seed) = seed {
        config.forest.seed = seed;
    }
    config.tune |= tune;

    let outcome = run(&config)?;
    println!();
    outcome.report.print();
    println!("Wrote {} files to {}", outcome.written.len(), config.output_dir.display());
    for path in &outcome.written {
        println!("  {}", path.display());
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    RunConfig::default().save(&path)?;
    println!("Default configuration written to {}", path.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Run {
            config,
            input,
            output_dir,
            num_trees,
            seed,
            tune,
        }) => run_analysis(config, input, output_dir, num_trees, seed, tune),
        Some(Commands::InitConfig { path }) => init_config(path),
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
