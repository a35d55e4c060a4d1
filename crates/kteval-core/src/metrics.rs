//! Ranking and thresholded metrics at interaction and group level.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EvalError;
use crate::fusion::{GroupResult, HIGH_THRESHOLD};

/// AUC reported when only one label class is present.
pub const AUC_SENTINEL: f64 = -1.0;

/// Metric level names, in report order.
pub const CONCEPTS: &str = "concepts";
pub const LATE_MEAN: &str = "late_mean";
pub const LATE_VOTE: &str = "late_vote";
pub const LATE_ALL: &str = "late_all";
pub const EARLY_PREDS: &str = "early_preds";

/// The sample holds a single label class, so AUC is undefined.
#[derive(Debug, Error)]
#[error("AUC undefined: {positives} positive and {negatives} negative labels")]
pub struct DegenerateMetric {
    pub positives: usize,
    pub negatives: usize,
}

/// Scores of one prediction level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub count: usize,
    pub auc: f64,
    pub accuracy: f64,
}

impl MetricReport {
    /// `false` when AUC is the single-class sentinel.
    pub fn has_auc(&self) -> bool {
        self.auc != AUC_SENTINEL
    }
}

/// Area under the ROC curve via average ranks (ties share their mean rank).
pub fn roc_auc(labels: &[u8], scores: &[f64]) -> Result<f64, DegenerateMetric> {
    let positives = labels.iter().filter(|l| **l == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(DegenerateMetric {
            positives,
            negatives,
        });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based; tied block i..=j shares the average rank
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for idx in &order[i..=j] {
            if labels[*idx] == 1 {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((rank_sum_pos - p * (p + 1.0) / 2.0) / (p * n))
}

/// Fraction of predictions whose thresholded label matches (ties positive).
pub fn accuracy(labels: &[u8], scores: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = labels
        .iter()
        .zip(scores)
        .filter(|(l, s)| u8::from(**s >= HIGH_THRESHOLD) == **l)
        .count();
    correct as f64 / labels.len() as f64
}

/// AUC (or the sentinel) and accuracy for one sample.
pub fn score(labels: &[u8], scores: &[f64]) -> MetricReport {
    let auc = match roc_auc(labels, scores) {
        Ok(auc) => auc,
        Err(e) => {
            tracing::debug!("{e}");
            AUC_SENTINEL
        }
    };
    MetricReport {
        count: labels.len(),
        auc,
        accuracy: accuracy(labels, scores),
    }
}

/// Running per-level samples, fed one fused batch at a time.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    concept_trues: Vec<u8>,
    concept_preds: Vec<f64>,
    late_trues: Vec<u8>,
    late_mean: Vec<f64>,
    late_vote: Vec<f64>,
    late_all: Vec<f64>,
    early_trues: Vec<u8>,
    early_preds: Vec<f64>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, group: &GroupResult) {
        for p in &group.predictions {
            self.concept_trues.push(group.truth);
            self.concept_preds.push(*p);
        }
        self.late_trues.push(group.truth);
        self.late_mean.push(group.late_mean);
        self.late_vote.push(group.late_vote);
        self.late_all.push(group.late_all);
        if let Some(early) = group.early {
            self.early_trues.push(group.truth);
            self.early_preds.push(early);
        }
    }

    pub fn extend<'a>(&mut self, groups: impl IntoIterator<Item = &'a GroupResult>) {
        for g in groups {
            self.add(g);
        }
    }

    pub fn group_count(&self) -> usize {
        self.late_trues.len()
    }

    pub fn interaction_count(&self) -> usize {
        self.concept_trues.len()
    }

    /// Scores every level. `early_preds` is present only if some group
    /// carried an early prediction, and then must cover every group with
    /// the same ground truth as the late levels.
    pub fn finish(&self) -> Result<BTreeMap<String, MetricReport>, EvalError> {
        let mut out = BTreeMap::new();
        out.insert(
            CONCEPTS.to_string(),
            score(&self.concept_trues, &self.concept_preds),
        );
        out.insert(LATE_MEAN.to_string(), score(&self.late_trues, &self.late_mean));
        out.insert(LATE_VOTE.to_string(), score(&self.late_trues, &self.late_vote));
        out.insert(LATE_ALL.to_string(), score(&self.late_trues, &self.late_all));

        if !self.early_trues.is_empty() {
            if self.early_trues != self.late_trues {
                let at = self
                    .early_trues
                    .iter()
                    .zip(&self.late_trues)
                    .position(|(e, l)| e != l)
                    .unwrap_or(self.early_trues.len().min(self.late_trues.len()));
                return Err(EvalError::integrity(
                    -1,
                    format!("early and late ground truths diverge at group index {at}"),
                ));
            }
            out.insert(
                EARLY_PREDS.to_string(),
                score(&self.early_trues, &self.early_preds),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(truth: u8, preds: &[f64], early: Option<f64>) -> GroupResult {
        GroupResult {
            group: 0,
            row: 0,
            sequence_id: "u1".into(),
            questions: vec![-1; preds.len()],
            concepts: vec![1; preds.len()],
            predictions: preds.to_vec(),
            truth,
            late_mean: crate::fusion::late_mean(preds),
            late_vote: crate::fusion::late_vote(preds),
            late_all: crate::fusion::late_all(preds),
            early,
        }
    }

    #[test]
    fn auc_perfect_and_inverted() {
        assert_eq!(roc_auc(&[0, 0, 1, 1], &[0.1, 0.2, 0.8, 0.9]).unwrap(), 1.0);
        assert_eq!(roc_auc(&[1, 1, 0, 0], &[0.1, 0.2, 0.8, 0.9]).unwrap(), 0.0);
    }

    #[test]
    fn auc_ties_count_half() {
        assert_eq!(roc_auc(&[0, 1], &[0.5, 0.5]).unwrap(), 0.5);
        // sklearn: roc_auc_score([0,0,1,1],[0.1,0.4,0.35,0.8]) == 0.75
        assert_eq!(roc_auc(&[0, 0, 1, 1], &[0.1, 0.4, 0.35, 0.8]).unwrap(), 0.75);
    }

    #[test]
    fn single_class_auc_is_sentinel() {
        assert!(roc_auc(&[1, 1, 1], &[0.2, 0.6, 0.9]).is_err());
        let report = score(&[1, 1, 1], &[0.2, 0.6, 0.9]);
        assert_eq!(report.auc, AUC_SENTINEL);
        assert!(!report.has_auc());
        assert!((report.accuracy - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn accuracy_ties_are_positive() {
        assert_eq!(accuracy(&[1, 0], &[0.5, 0.49]), 1.0);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn accumulator_levels() {
        let mut acc = MetricsAccumulator::new();
        acc.add(&group(1, &[0.9, 0.95], Some(0.8)));
        acc.add(&group(0, &[0.9, 0.3], Some(0.4)));
        assert_eq!(acc.group_count(), 2);
        assert_eq!(acc.interaction_count(), 4);

        let m = acc.finish().unwrap();
        assert_eq!(m[CONCEPTS].count, 4);
        assert_eq!(m[LATE_ALL].count, 2);
        assert_eq!(m[LATE_ALL].auc, 1.0);
        assert_eq!(m[EARLY_PREDS].accuracy, 1.0);
    }

    #[test]
    fn no_early_level_without_early_predictions() {
        let mut acc = MetricsAccumulator::new();
        acc.add(&group(1, &[0.7], None));
        let m = acc.finish().unwrap();
        assert!(!m.contains_key(EARLY_PREDS));
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn partial_early_coverage_is_an_integrity_error() {
        let mut acc = MetricsAccumulator::new();
        acc.add(&group(1, &[0.7], Some(0.7)));
        acc.add(&group(0, &[0.2], None));
        assert!(matches!(
            acc.finish(),
            Err(EvalError::GroupIntegrity { .. })
        ));
    }
}
