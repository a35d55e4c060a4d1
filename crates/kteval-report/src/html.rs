//! HTML report generator.
//!
//! Produces a self-contained HTML file with all CSS/JS inlined.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use kteval_core::metrics::MetricReport;
use kteval_core::report::EvalReport;

use crate::format_auc;

/// Escape a string for safe HTML insertion.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Generate an HTML report from an eval report.
pub fn generate_html(report: &EvalReport) -> String {
    let mut html = String::new();

    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
    html.push_str("<meta charset=\"utf-8\">\n");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    html.push_str(&format!(
        "<title>kteval report: {} on {}</title>\n",
        html_escape(&report.predictor),
        html_escape(&report.dataset.name)
    ));
    html.push_str("<style>\n");
    html.push_str(CSS);
    html.push_str("</style>\n");
    html.push_str("</head>\n<body>\n");

    html.push_str("<header>\n");
    html.push_str("<h1>kteval report</h1>\n");
    html.push_str(&format!(
        "<p class=\"meta\">Predictor: <strong>{}</strong> | Dataset: <strong>{}</strong> | {} | {} | {}</p>\n",
        html_escape(&report.predictor),
        html_escape(&report.dataset.name),
        report.mode,
        html_escape(&report.layout.to_string()),
        report.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    html.push_str(&format!(
        "<p class=\"meta\">{} sequences | {} interactions | {} groups scored | {} interactions scored | {}ms</p>\n",
        report.dataset.sequences,
        report.dataset.interactions,
        report.groups,
        report.interactions,
        report.duration_ms
    ));
    html.push_str("</header>\n");

    html.push_str("<section class=\"dashboard\">\n");
    html.push_str("<h2>Metrics</h2>\n");
    html.push_str("<table class=\"summary\" id=\"metrics\">\n");
    html.push_str("<thead><tr><th onclick=\"sortTable(0)\">Level</th><th onclick=\"sortTable(1)\">Count</th><th onclick=\"sortTable(2)\">AUC</th><th onclick=\"sortTable(3)\">Accuracy</th></tr></thead>\n");
    html.push_str("<tbody>\n");
    for (level, m) in &report.metrics {
        let class = if m.has_auc() { "" } else { " class=\"degenerate\"" };
        html.push_str(&format!(
            "<tr{}><td>{}</td><td>{}</td><td>{}</td><td>{:.4}</td></tr>\n",
            class,
            html_escape(level),
            m.count,
            format_auc(m.auc),
            m.accuracy
        ));
    }
    html.push_str("</tbody></table>\n");

    if report.metrics.values().any(MetricReport::has_auc) {
        html.push_str(&generate_bar_chart(&report.metrics));
    }
    html.push_str("</section>\n");

    if !report.excluded.is_empty() || !report.discarded_groups.is_empty() {
        html.push_str("<section class=\"exclusions\">\n");
        html.push_str("<h2>Exclusions</h2>\n");
        if !report.excluded.is_empty() {
            html.push_str("<table>\n<thead><tr><th>Sequence</th><th>Reason</th></tr></thead>\n<tbody>\n");
            for e in &report.excluded {
                html.push_str(&format!(
                    "<tr class=\"fail\"><td>{}</td><td>{}</td></tr>\n",
                    html_escape(&e.sequence_id),
                    html_escape(&e.reason)
                ));
            }
            html.push_str("</tbody></table>\n");
        }
        if !report.discarded_groups.is_empty() {
            let ids: Vec<String> = report.discarded_groups.iter().map(|g| g.to_string()).collect();
            html.push_str(&format!(
                "<p>Incomplete groups discarded at end of run: {}</p>\n",
                ids.join(", ")
            ));
        }
        html.push_str("</section>\n");
    }

    html.push_str("<section class=\"raw-data\">\n");
    html.push_str("<details>\n<summary>Raw JSON Data</summary>\n");
    html.push_str("<pre><code>");
    html.push_str(&html_escape(
        &serde_json::to_string_pretty(report).unwrap_or_default(),
    ));
    html.push_str("</code></pre>\n");
    html.push_str("</details>\n</section>\n");

    html.push_str("<script>\n");
    html.push_str(JS);
    html.push_str("</script>\n");

    html.push_str("</body>\n</html>");
    html
}

/// Write an HTML report to a file.
pub fn write_html_report(report: &EvalReport, path: &Path) -> Result<()> {
    let html = generate_html(report);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, html)
        .with_context(|| format!("failed to write HTML report to {}", path.display()))?;
    Ok(())
}

/// Horizontal AUC bars, one per level with a defined AUC.
fn generate_bar_chart(metrics: &BTreeMap<String, MetricReport>) -> String {
    let bar_height = 30;
    let max_width = 400;
    let padding = 10;
    let label_width = 160;

    let levels: Vec<(&String, f64)> = metrics
        .iter()
        .filter(|(_, m)| m.has_auc())
        .map(|(l, m)| (l, m.auc))
        .collect();

    let total_height = levels.len() * (bar_height + padding) + padding;

    let mut svg = format!(
        "<svg width=\"{}\" height=\"{}\" xmlns=\"http://www.w3.org/2000/svg\">\n",
        label_width + max_width + 60,
        total_height
    );

    for (i, (level, auc)) in levels.iter().enumerate() {
        let y = i * (bar_height + padding) + padding;
        let width = (auc * max_width as f64) as usize;

        let color = if *auc >= 0.75 {
            "#22c55e"
        } else if *auc > 0.5 {
            "#eab308"
        } else {
            "#ef4444"
        };

        svg.push_str(&format!(
            "  <text x=\"{}\" y=\"{}\" font-size=\"14\" fill=\"currentColor\" text-anchor=\"end\" dominant-baseline=\"middle\">{}</text>\n",
            label_width - 10,
            y + bar_height / 2,
            html_escape(level)
        ));
        svg.push_str(&format!(
            "  <rect x=\"{}\" y=\"{}\" width=\"{}\" height=\"{}\" fill=\"{}\" rx=\"4\"/>\n",
            label_width, y, width, bar_height, color
        ));
        svg.push_str(&format!(
            "  <text x=\"{}\" y=\"{}\" font-size=\"12\" fill=\"currentColor\" dominant-baseline=\"middle\">{:.4}</text>\n",
            label_width + width + 8,
            y + bar_height / 2,
            auc
        ));
    }

    svg.push_str("</svg>\n");
    svg
}

const CSS: &str = r#"
:root { --bg: #fff; --fg: #1a1a1a; --border: #e5e7eb; --fail: #fde2e2; --muted: #9ca3af; }
@media (prefers-color-scheme: dark) {
  :root { --bg: #111827; --fg: #f9fafb; --border: #374151; --fail: #7f1d1d; --muted: #6b7280; }
}
body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif; margin: 0; padding: 2rem; background: var(--bg); color: var(--fg); }
h1, h2 { margin-top: 2rem; }
.meta { color: #6b7280; }
table { border-collapse: collapse; width: 100%; margin: 1rem 0; }
th, td { border: 1px solid var(--border); padding: 0.5rem 1rem; text-align: left; }
th { background: var(--border); cursor: pointer; }
.fail { background: var(--fail); }
.degenerate td { color: var(--muted); }
pre { overflow-x: auto; padding: 1rem; background: var(--border); border-radius: 8px; }
code { font-family: 'JetBrains Mono', 'Fira Code', monospace; font-size: 0.85rem; }
details { margin: 1rem 0; }
summary { cursor: pointer; font-weight: bold; }
svg { margin: 1rem 0; }
"#;

const JS: &str = r#"
function sortTable(col) {
  const table = document.getElementById('metrics');
  const tbody = table.querySelector('tbody');
  const rows = Array.from(tbody.querySelectorAll('tr'));
  const asc = table.dataset.sortCol == col && table.dataset.sortDir == 'asc' ? false : true;
  rows.sort((a, b) => {
    const va = a.cells[col].textContent;
    const vb = b.cells[col].textContent;
    const na = parseFloat(va), nb = parseFloat(vb);
    const cmp = isNaN(na) || isNaN(nb) ? va.localeCompare(vb) : na - nb;
    return asc ? cmp : -cmp;
  });
  table.dataset.sortCol = col;
  table.dataset.sortDir = asc ? 'asc' : 'desc';
  rows.forEach(r => tbody.appendChild(r));
}
"#;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kteval_core::dataset::{DatasetSummary, LaneLayout};
    use kteval_core::metrics::AUC_SENTINEL;
    use kteval_core::model::{FieldSet, StepMode};
    use kteval_core::report::ExcludedSequence;

    pub(crate) fn make_test_report() -> EvalReport {
        let metric = |count, auc, accuracy| MetricReport {
            count,
            auc,
            accuracy,
        };
        EvalReport {
            id: uuid::Uuid::nil(),
            created_at: chrono::Utc::now(),
            predictor: "baseline".into(),
            mode: StepMode::TeacherForced,
            layout: LaneLayout::Question { max_len: 200 },
            dataset: DatasetSummary {
                name: "assist<09>".into(),
                sequences: 3,
                interactions: 40,
                groups: 30,
                fields: FieldSet::default(),
            },
            metrics: BTreeMap::from([
                ("concepts".to_string(), metric(35, 0.7312, 0.7)),
                ("late_mean".to_string(), metric(27, 0.7101, 0.6667)),
                ("late_all".to_string(), metric(27, AUC_SENTINEL, 1.0)),
            ]),
            groups: 27,
            interactions: 35,
            excluded: vec![ExcludedSequence {
                sequence_id: "u7".into(),
                reason: "missing timestamps at position 0".into(),
            }],
            discarded_groups: vec![],
            duration_ms: 1000,
        }
    }

    #[test]
    fn html_report_contains_required_elements() {
        let html = generate_html(&make_test_report());

        assert!(html.contains("<html"));
        assert!(html.contains("</html>"));
        assert!(html.contains("baseline"));
        assert!(html.contains("assist&lt;09&gt;"));
        assert!(!html.contains("assist<09>"));
        assert!(html.contains("<td>late_mean</td><td>27</td><td>0.7101</td>"));
        assert!(html.contains("u7"));
    }

    #[test]
    fn sentinel_auc_is_shown_as_na_and_not_charted() {
        let html = generate_html(&make_test_report());
        assert!(html.contains("<tr class=\"degenerate\"><td>late_all</td><td>27</td><td>n/a</td>"));
        let svg = &html[html.find("<svg").unwrap()..html.find("</svg>").unwrap()];
        assert!(svg.contains("concepts"));
        assert!(!svg.contains("late_all"));
    }

    #[test]
    fn html_report_write_to_file() {
        let report = make_test_report();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.html");

        write_html_report(&report, &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("<html"));
    }
}
