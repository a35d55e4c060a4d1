//! Core trait definitions for step predictors.
//!
//! Concrete predictors live in the `kteval-predictors` crate. Each one
//! shapes the uniform `StepInput` into whatever its model needs; the
//! engine never dispatches on model identity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::fusion::EarlyFusionHead;
use crate::model::{FieldSet, ForgetFeatures, Interaction};
use crate::window::{WindowSnapshot, NO_QUESTION, NO_TIMESTAMP};

// ---------------------------------------------------------------------------
// Predictor trait
// ---------------------------------------------------------------------------

/// An opaque model that maps a context window to a probability.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Human-readable predictor name (e.g. "remote", "constant").
    fn name(&self) -> &str;

    /// Descriptive metadata for listings and reports.
    fn info(&self) -> PredictorInfo;

    /// Auxiliary fields that must be present in every input.
    fn requirements(&self) -> FieldSet {
        FieldSet::default()
    }

    /// Combination rule for group-mean representations, if the predictor
    /// exposes representations at all.
    fn fusion_head(&self) -> Option<EarlyFusionHead> {
        None
    }

    /// Predict the query position of one input.
    async fn predict(&self, input: &StepInput) -> anyhow::Result<StepOutput>;

    /// Predict many independent inputs. Implementations backed by a
    /// vectorized model should override this; outputs must keep input order.
    async fn predict_batch(&self, inputs: &[StepInput]) -> anyhow::Result<Vec<StepOutput>> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            outputs.push(self.predict(input).await?);
        }
        Ok(outputs)
    }
}

/// Information about a configured predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorInfo {
    pub name: String,
    /// Adapter kind (e.g. "http", "constant").
    pub kind: String,
    /// Model identifier, when the predictor wraps a served model.
    #[serde(default)]
    pub model: Option<String>,
    pub requirements: FieldSet,
    pub early_fusion: bool,
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Fields of the position being predicted. The response is withheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFields {
    pub concept: i64,
    /// [`NO_QUESTION`] when unavailable.
    pub question: i64,
    /// [`NO_TIMESTAMP`] when unavailable.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forget: Option<ForgetFeatures>,
}

impl From<&Interaction> for QueryFields {
    fn from(it: &Interaction) -> Self {
        Self {
            concept: it.concept,
            question: it.question.unwrap_or(NO_QUESTION),
            timestamp: it.timestamp.unwrap_or(NO_TIMESTAMP),
            forget: it.forget,
        }
    }
}

/// One prediction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub sequence_id: String,
    /// Index of the query row inside its lane.
    pub position: usize,
    pub history: WindowSnapshot,
    pub query: QueryFields,
}

/// Model-internal vectors behind a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub primary: Vec<f64>,
    /// Second representation kind, for bilinear heads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<Vec<f64>>,
}

/// A probability for the query position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub probability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub representation: Option<Representation>,
}

impl StepOutput {
    pub fn probability(probability: f64) -> Self {
        Self {
            probability,
            representation: None,
        }
    }
}
