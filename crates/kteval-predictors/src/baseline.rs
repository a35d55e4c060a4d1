//! Reference predictors that need no served model.
//!
//! `ConstantPredictor` answers the same probability everywhere and is the
//! floor every metric level is read against. `ConceptRatePredictor` scores
//! a query by the learner's smoothed success rate on the same concept
//! inside the visible window, optionally decayed by elapsed time.

use async_trait::async_trait;

use kteval_core::fusion::EarlyFusionHead;
use kteval_core::model::FieldSet;
use kteval_core::traits::{Predictor, PredictorInfo, Representation, StepInput, StepOutput};
use kteval_core::window::NO_TIMESTAMP;

pub const DEFAULT_PRIOR: f64 = 0.5;
pub const DEFAULT_STRENGTH: f64 = 1.0;

// ---------------------------------------------------------------------------
// Constant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConstantPredictor {
    name: String,
    probability: f64,
}

impl ConstantPredictor {
    pub fn new(name: impl Into<String>, probability: f64) -> anyhow::Result<Self> {
        if !(0.0..=1.0).contains(&probability) {
            anyhow::bail!("constant probability must be in [0, 1], got {probability}");
        }
        Ok(Self {
            name: name.into(),
            probability,
        })
    }
}

#[async_trait]
impl Predictor for ConstantPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> PredictorInfo {
        PredictorInfo {
            name: self.name.clone(),
            kind: "constant".into(),
            model: None,
            requirements: FieldSet::default(),
            early_fusion: false,
        }
    }

    async fn predict(&self, _input: &StepInput) -> anyhow::Result<StepOutput> {
        Ok(StepOutput::probability(self.probability))
    }
}

// ---------------------------------------------------------------------------
// Concept rate
// ---------------------------------------------------------------------------

/// Smoothed per-concept success rate over the context window.
///
/// With `prior` p, `strength` k and weighted counts over the window rows
/// on the query concept, the estimate is `(Σw·label + k·p) / (Σw + k)`.
/// Without a half-life every weight is 1; with one, a row `Δt` seconds
/// before the query weighs `0.5^(Δt / half_life)`.
#[derive(Debug, Clone)]
pub struct ConceptRatePredictor {
    name: String,
    prior: f64,
    strength: f64,
    half_life_secs: Option<f64>,
}

impl ConceptRatePredictor {
    pub fn new(
        name: impl Into<String>,
        prior: f64,
        strength: f64,
        half_life_secs: Option<f64>,
    ) -> anyhow::Result<Self> {
        if !(0.0..=1.0).contains(&prior) {
            anyhow::bail!("prior must be in [0, 1], got {prior}");
        }
        if !(strength > 0.0 && strength.is_finite()) {
            anyhow::bail!("strength must be positive, got {strength}");
        }
        if let Some(h) = half_life_secs {
            if !(h > 0.0 && h.is_finite()) {
                anyhow::bail!("half_life_secs must be positive, got {h}");
            }
        }
        Ok(Self {
            name: name.into(),
            prior,
            strength,
            half_life_secs,
        })
    }

    fn weight(&self, now: i64, then: i64) -> f64 {
        match self.half_life_secs {
            Some(h) if now != NO_TIMESTAMP && then != NO_TIMESTAMP => {
                let elapsed = (now - then).max(0) as f64;
                0.5f64.powf(elapsed / h)
            }
            _ => 1.0,
        }
    }

    /// Smoothed success estimate for the query of `input`.
    pub fn estimate(&self, input: &StepInput) -> f64 {
        let history = &input.history;
        let (mut hits, mut total) = (0.0, 0.0);
        for i in 0..history.len() {
            if history.concepts[i] != input.query.concept {
                continue;
            }
            let w = self.weight(input.query.timestamp, history.timestamps[i]);
            hits += w * f64::from(history.labels[i]);
            total += w;
        }
        (hits + self.strength * self.prior) / (total + self.strength)
    }
}

fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    (p / (1.0 - p)).ln()
}

#[async_trait]
impl Predictor for ConceptRatePredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> PredictorInfo {
        PredictorInfo {
            name: self.name.clone(),
            kind: "concept_rate".into(),
            model: None,
            requirements: self.requirements(),
            early_fusion: true,
        }
    }

    fn requirements(&self) -> FieldSet {
        FieldSet {
            timestamps: self.half_life_secs.is_some(),
            ..FieldSet::default()
        }
    }

    /// The group estimate is the sigmoid of the mean per-row logit.
    fn fusion_head(&self) -> Option<EarlyFusionHead> {
        Some(EarlyFusionHead::Linear {
            weights: vec![1.0],
            bias: 0.0,
        })
    }

    async fn predict(&self, input: &StepInput) -> anyhow::Result<StepOutput> {
        let probability = self.estimate(input);
        Ok(StepOutput {
            probability,
            representation: Some(Representation {
                primary: vec![logit(probability)],
                secondary: None,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kteval_core::traits::QueryFields;
    use kteval_core::window::WindowSnapshot;

    fn input(history: &[(i64, u8, i64)], concept: i64, timestamp: i64) -> StepInput {
        StepInput {
            sequence_id: "u1".into(),
            position: history.len(),
            history: WindowSnapshot {
                concepts: history.iter().map(|h| h.0).collect(),
                labels: history.iter().map(|h| h.1).collect(),
                questions: vec![-1; history.len()],
                timestamps: history.iter().map(|h| h.2).collect(),
                forget: vec![None; history.len()],
            },
            query: QueryFields {
                concept,
                question: -1,
                timestamp,
                forget: None,
            },
        }
    }

    #[tokio::test]
    async fn constant_ignores_input() {
        let p = ConstantPredictor::new("constant", 0.3).unwrap();
        let out = p.predict(&input(&[(1, 1, 0)], 1, 10)).await.unwrap();
        assert_eq!(out.probability, 0.3);
        assert!(out.representation.is_none());
        assert!(ConstantPredictor::new("bad", 1.5).is_err());
    }

    #[test]
    fn rate_uses_only_matching_concept() {
        let p = ConceptRatePredictor::new("rate", 0.5, 1.0, None).unwrap();
        // two hits and one miss on concept 7, noise on concept 2
        let inp = input(&[(7, 1, 0), (2, 0, 0), (7, 1, 0), (7, 0, 0), (2, 0, 0)], 7, 0);
        let expected = (2.0 + 0.5) / (3.0 + 1.0);
        assert!((p.estimate(&inp) - expected).abs() < 1e-12);
    }

    #[test]
    fn empty_history_returns_prior() {
        let p = ConceptRatePredictor::new("rate", 0.7, 2.0, None).unwrap();
        assert!((p.estimate(&input(&[], 3, -1)) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn half_life_discounts_old_rows() {
        let p = ConceptRatePredictor::new("rate", 0.5, 1.0, Some(100.0)).unwrap();
        // a miss one half-life ago and a hit just now
        let inp = input(&[(4, 0, 0), (4, 1, 100)], 4, 100);
        let expected = (1.0 + 0.5) / (1.5 + 1.0);
        assert!((p.estimate(&inp) - expected).abs() < 1e-12);
        assert!(p.requirements().timestamps);
    }

    #[tokio::test]
    async fn representation_matches_logit_head() {
        let p = ConceptRatePredictor::new("rate", 0.5, 1.0, None).unwrap();
        let out = p.predict(&input(&[(1, 1, -1)], 1, -1)).await.unwrap();
        let rep = out.representation.unwrap();
        let head = p.fusion_head().unwrap();
        let fused = head.apply(&rep.primary, None).unwrap();
        assert!((fused - out.probability).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(ConceptRatePredictor::new("r", -0.1, 1.0, None).is_err());
        assert!(ConceptRatePredictor::new("r", 0.5, 0.0, None).is_err());
        assert!(ConceptRatePredictor::new("r", 0.5, 1.0, Some(0.0)).is_err());
    }
}
