//! Step predictor adapter: field checks, batching, retries and output
//! validation around an opaque [`Predictor`].

use std::sync::Arc;
use std::time::Duration;

use crate::error::{EvalError, PredictorError};
use crate::fusion::EarlyFusionHead;
use crate::model::{FieldSet, Interaction};
use crate::traits::{Predictor, StepInput, StepOutput};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Wraps a predictor with the engine's calling conventions.
#[derive(Clone)]
pub struct StepPredictor {
    inner: Arc<dyn Predictor>,
    batch_size: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl StepPredictor {
    pub fn new(
        inner: Arc<dyn Predictor>,
        batch_size: usize,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            max_retries,
            retry_delay,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn requirements(&self) -> FieldSet {
        self.inner.requirements()
    }

    pub fn fusion_head(&self) -> Option<EarlyFusionHead> {
        self.inner.fusion_head()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fails with `IncompatibleInput` if the interaction lacks a field the
    /// predictor requires.
    pub fn check_input(
        &self,
        sequence_id: &str,
        position: usize,
        interaction: &Interaction,
    ) -> Result<(), EvalError> {
        let missing = self
            .inner
            .requirements()
            .missing(&FieldSet::of(interaction));
        match missing.first() {
            Some(&field) => Err(EvalError::IncompatibleInput {
                sequence_id: sequence_id.to_string(),
                position,
                field,
            }),
            None => Ok(()),
        }
    }

    /// Predict a single input.
    pub async fn predict(&self, input: &StepInput) -> Result<StepOutput, EvalError> {
        let mut outputs = self.predict_many(std::slice::from_ref(input)).await?;
        outputs.pop().ok_or_else(|| {
            EvalError::Predictor(
                PredictorError::BatchMismatch {
                    expected: 1,
                    actual: 0,
                }
                .into(),
            )
        })
    }

    /// Predict many inputs in chunks of at most `batch_size`, keeping order.
    pub async fn predict_many(&self, inputs: &[StepInput]) -> Result<Vec<StepOutput>, EvalError> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for chunk in inputs.chunks(self.batch_size) {
            let chunk_out = self.call_with_retry(chunk).await?;
            outputs.extend(chunk_out);
        }
        Ok(outputs)
    }

    async fn call_with_retry(&self, chunk: &[StepInput]) -> Result<Vec<StepOutput>, EvalError> {
        let mut last_error = None;
        let mut retry_delay = self.retry_delay;
        for retry in 0..=self.max_retries {
            if retry > 0 {
                tokio::time::sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
            let result = if chunk.len() == 1 {
                self.inner.predict(&chunk[0]).await.map(|o| vec![o])
            } else {
                self.inner.predict_batch(chunk).await
            };
            match result.and_then(|out| validate(chunk.len(), out)) {
                Ok(out) => return Ok(out),
                Err(e) => {
                    let classified = e.downcast_ref::<PredictorError>();
                    if classified.is_some_and(PredictorError::is_permanent) {
                        return Err(EvalError::Predictor(e));
                    }
                    if let Some(ms) = classified.and_then(PredictorError::retry_after_ms) {
                        retry_delay = retry_delay.max(Duration::from_millis(ms));
                    }
                    tracing::debug!(
                        predictor = self.inner.name(),
                        attempt = retry + 1,
                        "predictor call failed: {e:#}"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(EvalError::Predictor(
            last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts made")),
        ))
    }
}

fn validate(expected: usize, outputs: Vec<StepOutput>) -> anyhow::Result<Vec<StepOutput>> {
    if outputs.len() != expected {
        return Err(PredictorError::BatchMismatch {
            expected,
            actual: outputs.len(),
        }
        .into());
    }
    if let Some(bad) = outputs
        .iter()
        .find(|o| !o.probability.is_finite() || !(0.0..=1.0).contains(&o.probability))
    {
        return Err(PredictorError::InvalidOutput(format!(
            "probability {} outside [0, 1]",
            bad.probability
        ))
        .into());
    }
    Ok(outputs)
}
