//! Markdown summary generator.

use anyhow::{Context, Result};
use std::path::Path;

use kteval_core::report::{EvalReport, RegressionReport};

use crate::format_auc;

/// Generate a Markdown summary of an eval report.
pub fn generate_markdown(report: &EvalReport) -> String {
    let mut md = String::new();

    md.push_str(&format!(
        "## kteval: {} on {}\n\n",
        report.predictor, report.dataset.name
    ));
    md.push_str(&format!(
        "Mode `{}`, layout `{}`. {} groups and {} interactions scored from {} sequences.\n\n",
        report.mode,
        report.layout,
        report.groups,
        report.interactions,
        report.dataset.sequences
    ));

    md.push_str("| Level | Count | AUC | Accuracy |\n");
    md.push_str("|-------|-------|-----|----------|\n");
    for (level, m) in &report.metrics {
        md.push_str(&format!(
            "| {} | {} | {} | {:.4} |\n",
            level,
            m.count,
            format_auc(m.auc),
            m.accuracy
        ));
    }
    md.push('\n');

    if !report.excluded.is_empty() {
        md.push_str(&format!("**Excluded sequences:** {}\n\n", report.excluded.len()));
        for e in &report.excluded {
            md.push_str(&format!("- `{}`: {}\n", e.sequence_id, e.reason));
        }
        md.push('\n');
    }
    if !report.discarded_groups.is_empty() {
        md.push_str(&format!(
            "**Discarded incomplete groups:** {}\n\n",
            report.discarded_groups.len()
        ));
    }

    md
}

/// Markdown for a baseline comparison, headed by both reports' identities.
pub fn comparison_markdown(
    current: &EvalReport,
    baseline: &EvalReport,
    comparison: &RegressionReport,
) -> String {
    let mut md = format!(
        "## kteval comparison\n\nBaseline: `{}` ({}), current: `{}` ({})\n\n",
        baseline.predictor,
        baseline.created_at.format("%Y-%m-%d %H:%M"),
        current.predictor,
        current.created_at.format("%Y-%m-%d %H:%M"),
    );
    md.push_str(&comparison.to_markdown());
    if comparison.skipped > 0 {
        md.push_str(&format!(
            "_{} AUC comparisons skipped (undefined on one side)._\n",
            comparison.skipped
        ));
    }
    md
}

/// Write a Markdown summary to a file.
pub fn write_markdown_report(report: &EvalReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, generate_markdown(report))
        .with_context(|| format!("failed to write Markdown report to {}", path.display()))?;
    Ok(())
}
