//! Eval report types with JSON persistence and regression detection.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dataset::{DatasetSummary, LaneLayout};
use crate::metrics::MetricReport;
use crate::model::StepMode;

/// A complete eval report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    /// Unique report identifier.
    pub id: Uuid,
    /// When the report was created.
    pub created_at: DateTime<Utc>,
    /// Name of the evaluated predictor.
    pub predictor: String,
    pub mode: StepMode,
    pub layout: LaneLayout,
    pub dataset: DatasetSummary,
    /// Metric level (`concepts`, `late_mean`, ...) to scores.
    pub metrics: BTreeMap<String, MetricReport>,
    /// Groups that reached fusion.
    pub groups: usize,
    /// Interactions that reached fusion.
    pub interactions: usize,
    /// Sequences dropped because the predictor could not accept them.
    #[serde(default)]
    pub excluded: Vec<ExcludedSequence>,
    /// Group ids left incomplete in the carry-forward buffer at the end.
    #[serde(default)]
    pub discarded_groups: Vec<i64>,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// A sequence excluded from evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedSequence {
    pub sequence_id: String,
    pub reason: String,
}

impl EvalReport {
    /// Save the report as JSON to a file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        Ok(())
    }

    /// Load a report from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report from {}", path.display()))?;
        let report: EvalReport =
            serde_json::from_str(&content).context("failed to parse report JSON")?;
        Ok(report)
    }

    /// Compare this report against a baseline. Every `(level, measure)`
    /// pair present in both is compared; sentinel AUCs are skipped.
    pub fn compare(&self, baseline: &EvalReport, threshold: f64) -> RegressionReport {
        let mut regressions = Vec::new();
        let mut improvements = Vec::new();
        let mut unchanged = 0usize;
        let mut skipped = 0usize;

        for (level, current) in &self.metrics {
            let Some(base) = baseline.metrics.get(level) else {
                continue;
            };
            let pairs = [
                (Measure::Auc, base.auc, current.auc, base.has_auc() && current.has_auc()),
                (Measure::Accuracy, base.accuracy, current.accuracy, true),
            ];
            for (measure, before, after, comparable) in pairs {
                if !comparable {
                    skipped += 1;
                    continue;
                }
                let delta = after - before;
                let entry = MetricDelta {
                    level: level.clone(),
                    measure,
                    baseline: before,
                    current: after,
                    delta,
                };
                if delta < -threshold {
                    regressions.push(entry);
                } else if delta > threshold {
                    improvements.push(entry);
                } else {
                    unchanged += 1;
                }
            }
        }

        let new_levels = self
            .metrics
            .keys()
            .filter(|k| !baseline.metrics.contains_key(*k))
            .count();
        let removed_levels = baseline
            .metrics
            .keys()
            .filter(|k| !self.metrics.contains_key(*k))
            .count();

        RegressionReport {
            regressions,
            improvements,
            unchanged,
            skipped,
            new_levels,
            removed_levels,
        }
    }
}

/// Which score of a metric level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Measure {
    Auc,
    Accuracy,
}

impl std::fmt::Display for Measure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Measure::Auc => write!(f, "auc"),
            Measure::Accuracy => write!(f, "accuracy"),
        }
    }
}

/// Change of one score between two reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDelta {
    pub level: String,
    pub measure: Measure,
    pub baseline: f64,
    pub current: f64,
    pub delta: f64,
}

/// Result of comparing two reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionReport {
    /// Scores that went down by more than the threshold.
    pub regressions: Vec<MetricDelta>,
    /// Scores that went up by more than the threshold.
    pub improvements: Vec<MetricDelta>,
    /// Scores with no significant change.
    pub unchanged: usize,
    /// Pairs skipped because one side had no AUC.
    pub skipped: usize,
    /// Levels in current but not baseline.
    pub new_levels: usize,
    /// Levels in baseline but not current.
    pub removed_levels: usize,
}

impl RegressionReport {
    /// Format the regression report as markdown.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str(&format!(
            "**Summary:** {} regressions, {} improvements, {} unchanged\n\n",
            self.regressions.len(),
            self.improvements.len(),
            self.unchanged
        ));

        for (title, rows) in [
            ("Regressions", &self.regressions),
            ("Improvements", &self.improvements),
        ] {
            if rows.is_empty() {
                continue;
            }
            md.push_str(&format!("### {title}\n\n"));
            md.push_str("| Level | Measure | Baseline | Current | Delta |\n");
            md.push_str("|-------|---------|----------|---------|-------|\n");
            for r in rows {
                md.push_str(&format!(
                    "| {} | {} | {:.4} | {:.4} | {:+.4} |\n",
                    r.level, r.measure, r.baseline, r.current, r.delta
                ));
            }
            md.push('\n');
        }

        md
    }

    /// Returns true if there are any regressions.
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AUC_SENTINEL;

    fn make_report(levels: &[(&str, f64, f64)]) -> EvalReport {
        EvalReport {
            id: Uuid::nil(),
            created_at: Utc::now(),
            predictor: "constant".into(),
            mode: StepMode::TeacherForced,
            layout: LaneLayout::Question { max_len: 200 },
            dataset: DatasetSummary::default(),
            metrics: levels
                .iter()
                .map(|(name, auc, acc)| {
                    (
                        name.to_string(),
                        MetricReport {
                            count: 10,
                            auc: *auc,
                            accuracy: *acc,
                        },
                    )
                })
                .collect(),
            groups: 10,
            interactions: 12,
            excluded: vec![],
            discarded_groups: vec![],
            duration_ms: 5,
        }
    }

    #[test]
    fn detects_regressions_and_improvements() {
        let baseline = make_report(&[("concepts", 0.80, 0.70), ("late_mean", 0.75, 0.70)]);
        let current = make_report(&[("concepts", 0.70, 0.705), ("late_mean", 0.90, 0.70)]);
        let cmp = current.compare(&baseline, 0.01);
        assert!(cmp.has_regressions());
        assert_eq!(cmp.regressions.len(), 1);
        assert_eq!(cmp.regressions[0].level, "concepts");
        assert_eq!(cmp.regressions[0].measure, Measure::Auc);
        assert_eq!(cmp.improvements.len(), 1);
        assert_eq!(cmp.unchanged, 2);

        let md = cmp.to_markdown();
        assert!(md.contains("### Regressions"));
        assert!(md.contains("| concepts | auc | 0.8000 | 0.7000 | -0.1000 |"));
    }

    #[test]
    fn sentinel_auc_is_not_compared() {
        let baseline = make_report(&[("late_all", AUC_SENTINEL, 0.5)]);
        let current = make_report(&[("late_all", 0.9, 0.5), ("early_preds", 0.8, 0.8)]);
        let cmp = current.compare(&baseline, 0.01);
        assert!(!cmp.has_regressions());
        assert!(cmp.improvements.is_empty());
        assert_eq!(cmp.skipped, 1);
        assert_eq!(cmp.new_levels, 1);
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        // needs the float_roundtrip parser to come back bit-exact
        let mut report = make_report(&[("concepts", 0.9876543209876543, 0.7407407407407407)]);
        report.excluded.push(ExcludedSequence {
            sequence_id: "u9".into(),
            reason: "missing timestamps".into(),
        });
        report.save_json(&path).unwrap();
        let loaded = EvalReport::load_json(&path).unwrap();
        assert_eq!(loaded.metrics, report.metrics);
        assert_eq!(loaded.excluded, report.excluded);
        assert_eq!(loaded.layout, report.layout);
        assert_eq!(
            loaded.metrics["concepts"].auc.to_bits(),
            report.metrics["concepts"].auc.to_bits()
        );
        assert!(!loaded.compare(&report, 0.0).has_regressions());
    }
}
