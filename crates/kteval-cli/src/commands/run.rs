//! The `kteval run` command.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use kteval_core::dataset::{load_dataset, LaneLayout};
use kteval_core::engine::{EvalEngine, ProgressReporter, TraceSinks};
use kteval_core::model::StepMode;
use kteval_core::report::EvalReport;
use kteval_predictors::{create_predictor, load_config_from};
use kteval_report::{write_html_report, write_markdown_report};

use crate::LayoutArg;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSONL dataset, one learner sequence per line
    #[arg(long)]
    pub data: PathBuf,

    /// Predictor name (default: from config)
    #[arg(long)]
    pub predictor: Option<String>,

    /// Config file path
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Lane layout
    #[arg(long, value_enum, default_value = "question")]
    pub layout: LayoutArg,

    /// Feed thresholded predictions back instead of ground truth
    #[arg(long)]
    pub use_pred: bool,

    /// Fraction of groups used as warm-up in the split layout
    #[arg(long, default_value = "0.2")]
    pub train_ratio: f64,

    /// Maximum model input length (history plus query)
    #[arg(long)]
    pub max_len: Option<usize>,

    /// Maximum inputs per predictor call
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Lanes per minibatch
    #[arg(long)]
    pub lanes_per_batch: Option<usize>,

    /// Skip the predictor's early-fusion head
    #[arg(long)]
    pub no_early_fusion: bool,

    /// Write the per-group trace to this file
    #[arg(long)]
    pub trace: Option<PathBuf>,

    /// Write the per-step trace to this file
    #[arg(long)]
    pub step_trace: Option<PathBuf>,

    /// Output directory (default: from config)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Output format: json, html, markdown, all
    #[arg(long, default_value = "json")]
    pub format: String,
}

/// Console progress reporter.
struct ConsoleReporter;

impl ProgressReporter for ConsoleReporter {
    fn on_batch_start(&self, index: usize, total: usize, lanes: usize) {
        eprintln!("  Batch {}/{total} ({lanes} lanes)", index + 1);
    }

    fn on_sequence_excluded(&self, sequence_id: &str, reason: &str) {
        eprintln!("  EXCLUDED: {sequence_id}: {reason}");
    }

    fn on_batch_complete(&self, index: usize, groups_emitted: usize, lanes_carried: usize) {
        eprintln!(
            "  Done: batch {} emitted {groups_emitted} groups, {lanes_carried} lanes carried",
            index + 1
        );
    }

    fn on_run_complete(&self, groups: usize, elapsed: Duration) {
        eprintln!(
            "\nComplete: {groups} groups scored ({:.1}s)",
            elapsed.as_secs_f64()
        );
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.train_ratio),
        "train ratio must be between 0.0 and 1.0"
    );

    let config = load_config_from(args.config.as_deref())?;
    let dataset = load_dataset(&args.data)?;

    let name = args
        .predictor
        .clone()
        .unwrap_or_else(|| config.default_predictor.clone());
    let predictor = create_predictor(&name, &config.predictor(&name)?)?;

    let mut engine_config = config.engine_config();
    if args.use_pred {
        engine_config.mode = StepMode::Autoregressive;
    }
    if let Some(n) = args.max_len {
        engine_config.max_len = n;
    }
    if let Some(n) = args.batch_size {
        engine_config.batch_size = n;
    }
    if let Some(n) = args.lanes_per_batch {
        engine_config.lanes_per_batch = n;
    }
    if args.no_early_fusion {
        engine_config.early_fusion = false;
    }

    let layout = match args.layout {
        LayoutArg::Question => LaneLayout::Question {
            max_len: engine_config.max_len,
        },
        LayoutArg::Split => LaneLayout::Split {
            train_ratio: args.train_ratio,
        },
    };

    let traces = TraceSinks::files(args.trace.as_deref(), args.step_trace.as_deref())
        .context("failed to open trace output")?;

    eprintln!(
        "kteval v{}: {} on {} ({} sequences, {}, {})",
        env!("CARGO_PKG_VERSION"),
        name,
        dataset.name,
        dataset.sequences.len(),
        engine_config.mode,
        layout
    );
    eprintln!();

    tracing::debug!(?engine_config, "engine configuration");
    let engine = EvalEngine::new(predictor, engine_config);
    let report = engine.run(&dataset, layout, traces, &ConsoleReporter).await?;

    print_summary(&report);

    let output = args.output.unwrap_or_else(|| config.output_dir.clone());
    std::fs::create_dir_all(&output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H%M%S");

    let formats: Vec<&str> = if args.format == "all" {
        vec!["json", "html", "markdown"]
    } else {
        args.format.split(',').map(str::trim).collect()
    };

    for fmt in &formats {
        match *fmt {
            "json" => {
                let path = output.join(format!("report-{timestamp}.json"));
                report.save_json(&path)?;
                eprintln!("Results saved to: {}", path.display());
            }
            "html" => {
                let path = output.join(format!("report-{timestamp}.html"));
                write_html_report(&report, &path)?;
                eprintln!("HTML report: {}", path.display());
            }
            "markdown" | "md" => {
                let path = output.join(format!("report-{timestamp}.md"));
                write_markdown_report(&report, &path)?;
                eprintln!("Markdown summary: {}", path.display());
            }
            _ => {
                eprintln!("Unknown format: {fmt}");
            }
        }
    }

    Ok(())
}

fn print_summary(report: &EvalReport) {
    use comfy_table::{Cell, Table};

    let mut table = Table::new();
    table.set_header(vec!["Level", "Count", "AUC", "Accuracy"]);

    for (level, m) in &report.metrics {
        let auc = if m.has_auc() {
            format!("{:.4}", m.auc)
        } else {
            "n/a".to_string()
        };
        table.add_row(vec![
            Cell::new(level),
            Cell::new(m.count),
            Cell::new(auc),
            Cell::new(format!("{:.4}", m.accuracy)),
        ]);
    }

    eprintln!("\n{table}");
    if !report.excluded.is_empty() {
        eprintln!("{} sequence(s) excluded", report.excluded.len());
    }
    if !report.discarded_groups.is_empty() {
        eprintln!(
            "{} incomplete group(s) discarded",
            report.discarded_groups.len()
        );
    }
}
