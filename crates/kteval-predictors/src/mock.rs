//! Mock predictor for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use kteval_core::fusion::EarlyFusionHead;
use kteval_core::model::FieldSet;
use kteval_core::traits::{Predictor, PredictorInfo, Representation, StepInput, StepOutput};

use crate::error::PredictorError;

/// A scripted predictor for exercising the engine without a served model.
///
/// Answers by query concept, falling back to a default probability.
pub struct MockPredictor {
    /// Concept id → probability.
    probabilities: HashMap<i64, f64>,
    default_probability: f64,
    requirements: FieldSet,
    /// When set, outputs carry `[p]` as their primary representation.
    head: Option<EarlyFusionHead>,
    /// Calls that still fail with a timeout before answering.
    failures: AtomicU32,
    call_count: AtomicU32,
    batch_count: AtomicU32,
    last_input: Mutex<Option<StepInput>>,
}

impl MockPredictor {
    pub fn new(probabilities: HashMap<i64, f64>) -> Self {
        Self {
            probabilities,
            default_probability: 0.5,
            requirements: FieldSet::default(),
            head: None,
            failures: AtomicU32::new(0),
            call_count: AtomicU32::new(0),
            batch_count: AtomicU32::new(0),
            last_input: Mutex::new(None),
        }
    }

    /// A mock that answers the same probability everywhere.
    pub fn with_fixed_probability(probability: f64) -> Self {
        Self {
            default_probability: probability,
            ..Self::new(HashMap::new())
        }
    }

    pub fn with_requirements(mut self, requirements: FieldSet) -> Self {
        self.requirements = requirements;
        self
    }

    /// Emit representations, combined by `head` at fusion time.
    pub fn with_fusion_head(mut self, head: EarlyFusionHead) -> Self {
        self.head = Some(head);
        self
    }

    /// Fail the next `n` calls with a transient timeout.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures.store(n, Ordering::Relaxed);
        self
    }

    /// Inputs answered so far, across single and batched calls.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Number of `predict_batch` invocations.
    pub fn batch_count(&self) -> u32 {
        self.batch_count.load(Ordering::Relaxed)
    }

    pub fn last_input(&self) -> Option<StepInput> {
        self.last_input.lock().unwrap().clone()
    }

    fn answer(&self, input: &StepInput) -> anyhow::Result<StepOutput> {
        let pending = self.failures.load(Ordering::Relaxed);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::Relaxed);
            return Err(PredictorError::Timeout(1).into());
        }
        self.call_count.fetch_add(1, Ordering::Relaxed);
        *self.last_input.lock().unwrap() = Some(input.clone());

        let probability = self
            .probabilities
            .get(&input.query.concept)
            .copied()
            .unwrap_or(self.default_probability);
        Ok(StepOutput {
            probability,
            representation: self.head.as_ref().map(|_| Representation {
                primary: vec![probability],
                secondary: None,
            }),
        })
    }
}

#[async_trait]
impl Predictor for MockPredictor {
    fn name(&self) -> &str {
        "mock"
    }

    fn info(&self) -> PredictorInfo {
        PredictorInfo {
            name: "mock".into(),
            kind: "mock".into(),
            model: Some("mock-model".into()),
            requirements: self.requirements,
            early_fusion: self.head.is_some(),
        }
    }

    fn requirements(&self) -> FieldSet {
        self.requirements
    }

    fn fusion_head(&self) -> Option<EarlyFusionHead> {
        self.head.clone()
    }

    async fn predict(&self, input: &StepInput) -> anyhow::Result<StepOutput> {
        self.answer(input)
    }

    async fn predict_batch(&self, inputs: &[StepInput]) -> anyhow::Result<Vec<StepOutput>> {
        self.batch_count.fetch_add(1, Ordering::Relaxed);
        inputs.iter().map(|i| self.answer(i)).collect()
    }
}
