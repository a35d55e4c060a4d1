//! kteval-report — Report rendering for kteval.
//!
//! Renders `EvalReport`s as self-contained HTML pages and Markdown
//! summaries suitable for pull request comments.

pub mod html;
pub mod markdown;

pub use html::{generate_html, write_html_report};
pub use markdown::{comparison_markdown, generate_markdown, write_markdown_report};

/// Formats an AUC for display, showing the sentinel as `n/a`.
pub(crate) fn format_auc(auc: f64) -> String {
    if auc < 0.0 {
        "n/a".to_string()
    } else {
        format!("{auc:.4}")
    }
}
