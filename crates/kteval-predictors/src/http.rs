//! Served-model predictor over HTTP.
//!
//! Posts batches of step inputs to `{base_url}/v1/predict` and expects one
//! output per input, in order:
//!
//! ```json
//! {"model": "dkt-assist09", "inputs": [{"sequence_id": "u1", "position": 3, ...}]}
//! {"outputs": [{"probability": 0.71, "representation": {"primary": [...]}}]}
//! ```

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use kteval_core::fusion::EarlyFusionHead;
use kteval_core::model::FieldSet;
use kteval_core::traits::{Predictor, PredictorInfo, StepInput, StepOutput};

use crate::error::{from_status, PredictorError};

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Predictor backed by a served model.
pub struct HttpPredictor {
    name: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    requirements: FieldSet,
    head: Option<EarlyFusionHead>,
    timeout_secs: u64,
}

impl std::fmt::Debug for HttpPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPredictor")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl HttpPredictor {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout_secs: Option<u64>,
    ) -> anyhow::Result<Self> {
        let timeout_secs = timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            requirements: FieldSet::default(),
            head: None,
            timeout_secs,
        })
    }

    /// Fields the served model reads.
    pub fn with_requirements(mut self, requirements: FieldSet) -> Self {
        self.requirements = requirements;
        self
    }

    /// Head applied to group-mean representations.
    pub fn with_fusion_head(mut self, head: Option<EarlyFusionHead>) -> Self {
        self.head = head;
        self
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PredictRequest<'a> {
    model: &'a str,
    inputs: &'a [StepInput],
}

#[derive(Deserialize)]
struct PredictResponse {
    outputs: Vec<StepOutput>,
}

#[async_trait]
impl Predictor for HttpPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> PredictorInfo {
        PredictorInfo {
            name: self.name.clone(),
            kind: "http".into(),
            model: Some(self.model.clone()),
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
        let mut outputs = self.predict_batch(std::slice::from_ref(input)).await?;
        outputs.pop().ok_or_else(|| {
            PredictorError::BatchMismatch {
                expected: 1,
                actual: 0,
            }
            .into()
        })
    }

    #[instrument(skip(self, inputs), fields(predictor = %self.name, model = %self.model, batch = inputs.len()))]
    async fn predict_batch(&self, inputs: &[StepInput]) -> anyhow::Result<Vec<StepOutput>> {
        let url = format!("{}/v1/predict", self.base_url);
        let body = PredictRequest {
            model: &self.model,
            inputs,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PredictorError::Timeout(self.timeout_secs)
            } else {
                PredictorError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status >= 400 {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(from_status(status, &headers, body, &self.model).into());
        }

        let parsed: PredictResponse =
            response
                .json()
                .await
                .map_err(|e| PredictorError::ApiError {
                    status: 0,
                    message: format!("failed to parse response: {e}"),
                })?;

        if parsed.outputs.len() != inputs.len() {
            return Err(PredictorError::BatchMismatch {
                expected: inputs.len(),
                actual: parsed.outputs.len(),
            }
            .into());
        }
        debug!(outputs = parsed.outputs.len(), "prediction batch complete");
        Ok(parsed.outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kteval_core::traits::QueryFields;
    use kteval_core::window::WindowSnapshot;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn input(position: usize, concept: i64) -> StepInput {
        StepInput {
            sequence_id: "u1".into(),
            position,
            history: WindowSnapshot {
                concepts: vec![3, 4],
                labels: vec![1, 0],
                questions: vec![-1, -1],
                timestamps: vec![-1, -1],
                forget: vec![None, None],
            },
            query: QueryFields {
                concept,
                question: -1,
                timestamp: -1,
                forget: None,
            },
        }
    }

    fn predictor(server: &MockServer) -> HttpPredictor {
        HttpPredictor::new("remote", &server.uri(), "dkt", Some("secret".into()), None).unwrap()
    }

    #[tokio::test]
    async fn batch_outputs_keep_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predict"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"model": "dkt"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "outputs": [
                    {"probability": 0.2},
                    {"probability": 0.9, "representation": {"primary": [0.5, -1.0]}}
                ]
            })))
            .mount(&server)
            .await;

        let p = predictor(&server);
        let out = p.predict_batch(&[input(2, 7), input(3, 8)]).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].probability, 0.2);
        assert!(out[0].representation.is_none());
        assert_eq!(out[1].representation.as_ref().unwrap().primary, vec![0.5, -1.0]);
    }

    #[tokio::test]
    async fn single_predict_goes_through_batch_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predict"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"outputs": [{"probability": 0.61}]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let out = predictor(&server).predict(&input(1, 5)).await.unwrap();
        assert_eq!(out.probability, 0.61);
    }

    #[tokio::test]
    async fn short_batch_is_a_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"outputs": [{"probability": 0.5}]})),
            )
            .mount(&server)
            .await;

        let err = predictor(&server)
            .predict_batch(&[input(1, 1), input(2, 2)])
            .await
            .unwrap_err();
        let err = err.downcast::<PredictorError>().unwrap();
        assert!(matches!(
            err,
            PredictorError::BatchMismatch {
                expected: 2,
                actual: 1
            }
        ));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let err = predictor(&server).predict(&input(1, 1)).await.unwrap_err();
        let err = err.downcast::<PredictorError>().unwrap();
        assert_eq!(err.retry_after_ms(), Some(3000));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn unauthorized_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = predictor(&server).predict(&input(1, 1)).await.unwrap_err();
        let err = err.downcast::<PredictorError>().unwrap();
        assert!(matches!(err, PredictorError::AuthenticationFailed(ref m) if m == "bad key"));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = predictor(&server).predict(&input(1, 1)).await.unwrap_err();
        let err = err.downcast::<PredictorError>().unwrap();
        assert!(matches!(err, PredictorError::ApiError { status: 503, .. }));
        assert!(!err.is_permanent());
    }

    #[test]
    fn debug_masks_api_key() {
        let p = HttpPredictor::new("remote", "http://localhost:9000/", "dkt", Some("sk-1".into()), Some(5))
            .unwrap();
        let dbg = format!("{p:?}");
        assert!(!dbg.contains("sk-1"));
        assert!(dbg.contains("http://localhost:9000\""));
    }
}
