//! Group-level fusion of interaction predictions.
//!
//! Late fusion combines probabilities (mean, majority-weighted re-mean,
//! unanimity). Early fusion averages the representations of a group and
//! hands the mean vectors to a predictor-specific [`EarlyFusionHead`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;
use crate::regroup::FrameRow;

/// Decision boundary shared by voting and accuracy.
pub const HIGH_THRESHOLD: f64 = 0.5;

// ---------------------------------------------------------------------------
// Late fusion
// ---------------------------------------------------------------------------

/// Rounds to 4 decimal digits.
pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Mean of `preferred`, or of `fallback` when `preferred` is empty.
fn mean_or(preferred: &[f64], fallback: &[f64]) -> f64 {
    mean(preferred).or_else(|| mean(fallback)).unwrap_or(HIGH_THRESHOLD)
}

fn split_high_low(predictions: &[f64]) -> (Vec<f64>, Vec<f64>) {
    predictions.iter().partition(|p| **p >= HIGH_THRESHOLD)
}

/// Arithmetic mean rounded to 4 decimal digits.
pub fn late_mean(predictions: &[f64]) -> f64 {
    round4(mean(predictions).unwrap_or(HIGH_THRESHOLD))
}

/// Mean of the high set if at least half the predictions are high,
/// otherwise mean of the low set.
pub fn late_vote(predictions: &[f64]) -> f64 {
    let (high, low) = split_high_low(predictions);
    let total = high.len() + low.len();
    if total > 0 && high.len() as f64 / total as f64 >= 0.5 {
        mean_or(&high, &low)
    } else {
        mean_or(&low, &high)
    }
}

/// Mean of the high set only if every prediction is high, otherwise mean
/// of the low set.
pub fn late_all(predictions: &[f64]) -> f64 {
    let (high, low) = split_high_low(predictions);
    if !predictions.is_empty() && low.is_empty() {
        mean_or(&high, &low)
    } else {
        mean_or(&low, &high)
    }
}

// ---------------------------------------------------------------------------
// Early fusion
// ---------------------------------------------------------------------------

/// Predictor-specific rule applied to a group's mean representations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EarlyFusionHead {
    /// σ(w·h + b) over the primary mean.
    Linear { weights: Vec<f64>, bias: f64 },
    /// σ(h₁·h₂) between the primary and secondary means.
    Dot,
    /// σ(scale·ability(h₁) − difficulty(h₂)), each a linear projection.
    AbilityDifficulty {
        ability: Projection,
        difficulty: Projection,
        scale: f64,
    },
    /// σ(h₁[0]).
    Logit,
}

/// A linear map to a scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,
}

impl Projection {
    fn apply(&self, v: &[f64]) -> Result<f64, EvalError> {
        Ok(dot(&self.weights, v)? + self.bias)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn dot(a: &[f64], b: &[f64]) -> Result<f64, EvalError> {
    if a.len() != b.len() {
        return Err(EvalError::Config(format!(
            "early fusion dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

impl EarlyFusionHead {
    /// Applies the head to the mean primary and (optional) secondary vectors.
    pub fn apply(&self, primary: &[f64], secondary: Option<&[f64]>) -> Result<f64, EvalError> {
        let need_secondary = || {
            secondary.ok_or_else(|| {
                EvalError::Config("early fusion head needs a secondary representation".into())
            })
        };
        let z = match self {
            EarlyFusionHead::Linear { weights, bias } => dot(weights, primary)? + bias,
            EarlyFusionHead::Dot => dot(primary, need_secondary()?)?,
            EarlyFusionHead::AbilityDifficulty {
                ability,
                difficulty,
                scale,
            } => scale * ability.apply(primary)? - difficulty.apply(need_secondary()?)?,
            EarlyFusionHead::Logit => *primary.first().ok_or_else(|| {
                EvalError::Config("early fusion head got an empty representation".into())
            })?,
        };
        Ok(sigmoid(z))
    }
}

/// Element-wise mean of equally sized vectors.
pub fn mean_vector<'a>(vectors: impl IntoIterator<Item = &'a [f64]>) -> Result<Vec<f64>, EvalError> {
    let mut sum: Vec<f64> = Vec::new();
    let mut count = 0usize;
    for v in vectors {
        if count == 0 {
            sum = v.to_vec();
        } else if v.len() != sum.len() {
            return Err(EvalError::Config(format!(
                "representation length changed within a group: {} vs {}",
                sum.len(),
                v.len()
            )));
        } else {
            for (s, x) in sum.iter_mut().zip(v) {
                *s += x;
            }
        }
        count += 1;
    }
    if count > 0 {
        for s in &mut sum {
            *s /= count as f64;
        }
    }
    Ok(sum)
}

// ---------------------------------------------------------------------------
// Group fusion
// ---------------------------------------------------------------------------

/// Fusion output for one complete group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub group: i64,
    pub row: i64,
    pub sequence_id: String,
    pub questions: Vec<i64>,
    pub concepts: Vec<i64>,
    pub predictions: Vec<f64>,
    pub truth: u8,
    pub late_mean: f64,
    pub late_vote: f64,
    pub late_all: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early: Option<f64>,
}

/// Fuses an emitted frame. Groups come out in ascending id order; rows
/// keep their frame order inside a group.
pub fn fuse(rows: &[FrameRow], head: Option<&EarlyFusionHead>) -> Result<Vec<GroupResult>, EvalError> {
    let mut groups: BTreeMap<i64, Vec<&FrameRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.group).or_default().push(row);
    }

    let mut results = Vec::with_capacity(groups.len());
    for (group, members) in groups {
        let (first, last) = match (members.first(), members.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => continue,
        };
        if last.rest != 0 {
            return Err(EvalError::integrity(
                group,
                format!("incomplete, {} rows still expected", last.rest),
            ));
        }
        if let Some(other) = members.iter().find(|r| r.response != first.response) {
            return Err(EvalError::integrity(
                group,
                format!(
                    "ground truth differs within group ({} vs {})",
                    first.response, other.response
                ),
            ));
        }

        let predictions: Vec<f64> = members.iter().map(|r| r.probability).collect();
        let early = match head {
            Some(head) => Some(early_fusion(group, &members, head)?),
            None => None,
        };
        results.push(GroupResult {
            group,
            row: first.row,
            sequence_id: first.sequence_id.clone(),
            questions: members.iter().map(|r| r.question.unwrap_or(-1)).collect(),
            concepts: members.iter().map(|r| r.concept).collect(),
            late_mean: late_mean(&predictions),
            late_vote: late_vote(&predictions),
            late_all: late_all(&predictions),
            predictions,
            truth: first.response,
            early,
        });
    }
    Ok(results)
}

fn early_fusion(group: i64, members: &[&FrameRow], head: &EarlyFusionHead) -> Result<f64, EvalError> {
    let mut reps = Vec::with_capacity(members.len());
    for row in members {
        match &row.representation {
            Some(rep) => reps.push(rep),
            None => {
                return Err(EvalError::Config(format!(
                    "group {group}: predictor returned no representation for early fusion"
                )))
            }
        }
    }
    let primary = mean_vector(reps.iter().map(|r| r.primary.as_slice()))?;
    let secondary = if reps.iter().all(|r| r.secondary.is_some()) {
        Some(mean_vector(reps.iter().filter_map(|r| r.secondary.as_deref()))?)
    } else {
        None
    };
    head.apply(&primary, secondary.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Representation;

    fn row(group: i64, rest: u32, response: u8, p: f64) -> FrameRow {
        FrameRow {
            group,
            rest,
            row: 0,
            sequence_id: "u1".into(),
            position: 0,
            selected: true,
            concept: group * 10,
            question: Some(group),
            response,
            probability: p,
            representation: None,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn late_all_requires_unanimity() {
        assert!(approx(late_all(&[0.9, 0.95]), 0.925));
        assert!(approx(late_all(&[0.9, 0.3]), 0.3));
    }

    #[test]
    fn late_vote_is_majority_weighted() {
        assert!(approx(late_vote(&[0.6, 0.6, 0.3]), 0.6));
        assert!(approx(late_vote(&[0.6, 0.2, 0.3]), 0.25));
        // an even split counts as a high majority
        assert!(approx(late_vote(&[0.8, 0.2]), 0.8));
    }

    #[test]
    fn all_half_is_high() {
        let preds = [0.5, 0.5, 0.5];
        assert_eq!(late_mean(&preds), 0.5);
        assert_eq!(late_vote(&preds), 0.5);
        assert_eq!(late_all(&preds), 0.5);
        let (high, low) = split_high_low(&preds);
        assert_eq!(high.len(), 3);
        assert!(low.is_empty());
    }

    #[test]
    fn empty_sets_fall_back_to_complement() {
        // all low: vote and all both take the low mean
        assert!(approx(late_vote(&[0.1, 0.3]), 0.2));
        assert!(approx(late_all(&[0.1, 0.3]), 0.2));
        assert_eq!(mean_or(&[], &[]), HIGH_THRESHOLD);
    }

    #[test]
    fn late_mean_rounds_to_four_digits() {
        assert_eq!(late_mean(&[0.12346, 0.12348]), 0.1235);
        assert_eq!(late_mean(&[1.0 / 3.0]), 0.3333);
    }

    #[test]
    fn fuse_orders_groups_by_id() {
        let rows = vec![row(5, 0, 1, 0.7), row(2, 1, 0, 0.4), row(2, 0, 0, 0.2)];
        let out = fuse(&rows, None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].group, 2);
        assert_eq!(out[0].predictions, vec![0.4, 0.2]);
        assert_eq!(out[0].truth, 0);
        assert_eq!(out[1].group, 5);
        assert!(out[1].early.is_none());
    }

    #[test]
    fn fuse_rejects_truth_mismatch() {
        let rows = vec![row(1, 1, 1, 0.7), row(1, 0, 0, 0.4)];
        let err = fuse(&rows, None).unwrap_err();
        assert!(matches!(err, EvalError::GroupIntegrity { group: 1, .. }));
    }

    #[test]
    fn fuse_rejects_incomplete_group() {
        let rows = vec![row(3, 2, 1, 0.7)];
        assert!(matches!(
            fuse(&rows, None),
            Err(EvalError::GroupIntegrity { group: 3, .. })
        ));
    }

    #[test]
    fn early_fusion_uses_mean_representation() {
        let mut a = row(1, 1, 1, 0.7);
        a.representation = Some(Representation {
            primary: vec![1.0, 3.0],
            secondary: Some(vec![1.0, 0.0]),
        });
        let mut b = row(1, 0, 1, 0.9);
        b.representation = Some(Representation {
            primary: vec![3.0, 1.0],
            secondary: Some(vec![0.0, 1.0]),
        });
        let rows = vec![a, b];

        let linear = EarlyFusionHead::Linear {
            weights: vec![0.5, -0.5],
            bias: 0.0,
        };
        // mean = [2, 2] -> z = 0
        let out = fuse(&rows, Some(&linear)).unwrap();
        assert_eq!(out[0].early, Some(0.5));

        // mean primary [2, 2], mean secondary [0.5, 0.5] -> z = 2
        let out = fuse(&rows, Some(&EarlyFusionHead::Dot)).unwrap();
        assert!(approx(out[0].early.unwrap(), sigmoid(2.0)));
    }

    #[test]
    fn early_fusion_needs_representations() {
        let rows = vec![row(1, 0, 1, 0.7)];
        let err = fuse(&rows, Some(&EarlyFusionHead::Logit)).unwrap_err();
        assert!(matches!(err, EvalError::Config(_)));
    }

    #[test]
    fn ability_difficulty_head() {
        let head = EarlyFusionHead::AbilityDifficulty {
            ability: Projection {
                weights: vec![1.0],
                bias: 0.0,
            },
            difficulty: Projection {
                weights: vec![1.0],
                bias: 0.5,
            },
            scale: 3.0,
        };
        let p = head.apply(&[1.0], Some(&[2.0])).unwrap();
        assert!(approx(p, sigmoid(3.0 - 2.5)));
        assert!(head.apply(&[1.0], None).is_err());
        assert!(head.apply(&[1.0, 2.0], Some(&[2.0])).is_err());
    }
}
