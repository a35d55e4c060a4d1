//! The `kteval compare` command.

use std::path::PathBuf;

use anyhow::Result;

use kteval_core::report::EvalReport;
use kteval_report::comparison_markdown;

pub fn execute(
    baseline_path: PathBuf,
    current_path: PathBuf,
    threshold: f64,
    fail_on_regression: bool,
    format: String,
) -> Result<()> {
    anyhow::ensure!(threshold >= 0.0, "threshold must not be negative");

    let baseline = EvalReport::load_json(&baseline_path)?;
    let current = EvalReport::load_json(&current_path)?;

    let report = current.compare(&baseline, threshold);

    match format.as_str() {
        "markdown" | "md" => {
            println!("{}", comparison_markdown(&current, &baseline, &report));
        }
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!(
                "Comparison: {} regressions, {} improvements, {} unchanged",
                report.regressions.len(),
                report.improvements.len(),
                report.unchanged
            );

            for (title, rows) in [
                ("Regressions", &report.regressions),
                ("Improvements", &report.improvements),
            ] {
                if rows.is_empty() {
                    continue;
                }
                println!("\n{title}:");
                for r in rows {
                    println!(
                        "  {} {}: {:.4} -> {:.4} ({:+.4})",
                        r.level, r.measure, r.baseline, r.current, r.delta
                    );
                }
            }

            if report.skipped > 0 {
                println!("\n{} AUC comparison(s) skipped (undefined AUC)", report.skipped);
            }
            if report.new_levels > 0 {
                println!("{} new metric level(s)", report.new_levels);
            }
            if report.removed_levels > 0 {
                println!("{} removed metric level(s)", report.removed_levels);
            }
        }
    }

    if fail_on_regression && report.has_regressions() {
        std::process::exit(1);
    }

    Ok(())
}
