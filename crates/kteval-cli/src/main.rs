//! kteval CLI — the user-facing command-line interface.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "kteval", version, about = "Knowledge-tracing predictor eval harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// How sequences are cut into lanes.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LayoutArg {
    /// Windowed per-question evaluation of every row after the first
    Question,
    /// Warm-up prefix of groups as context, remaining groups scored
    Split,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a predictor on a dataset
    Run(commands::run::RunArgs),

    /// Compare two eval reports
    Compare {
        /// Baseline report JSON
        #[arg(long)]
        baseline: PathBuf,

        /// Current report JSON
        #[arg(long)]
        current: PathBuf,

        /// Regression threshold
        #[arg(long, default_value = "0.01")]
        threshold: f64,

        /// Exit code 1 if regressions found
        #[arg(long)]
        fail_on_regression: bool,

        /// Output format: text, json, markdown
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Validate a JSONL dataset
    Validate {
        /// Path to the dataset
        #[arg(long)]
        data: PathBuf,
    },

    /// List configured and built-in predictors
    ListPredictors {
        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create starter config and example dataset
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kteval=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Compare {
            baseline,
            current,
            threshold,
            fail_on_regression,
            format,
        } => commands::compare::execute(baseline, current, threshold, fail_on_regression, format),
        Commands::Validate { data } => commands::validate::execute(data),
        Commands::ListPredictors { config } => commands::list_predictors::execute(config),
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
