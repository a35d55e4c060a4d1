//! Error types for the evaluation engine and predictor backends.
//!
//! `PredictorError` is defined here rather than in `kteval-predictors` so the
//! step adapter can downcast and classify failures for retry decisions
//! without string matching.

use thiserror::Error;

/// Errors that can occur when calling a predictor backend.
#[derive(Debug, Error)]
pub enum PredictorError {
    /// The backend returned a 429 rate limit response.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Authentication failed (invalid API key).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The requested model is not served by the backend.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The backend returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The predictor answered with something that is not a probability.
    #[error("invalid predictor output: {0}")]
    InvalidOutput(String),

    /// A batched call returned the wrong number of outputs.
    #[error("batch size mismatch: sent {expected} inputs, got {actual} outputs")]
    BatchMismatch { expected: usize, actual: usize },
}

impl PredictorError {
    /// Returns `true` if this error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            PredictorError::AuthenticationFailed(_)
            | PredictorError::ModelNotFound(_)
            | PredictorError::InvalidOutput(_)
            | PredictorError::BatchMismatch { .. } => true,
            PredictorError::ApiError { status, .. } => *status < 500 && *status != 0,
            _ => false,
        }
    }

    /// Returns the retry-after delay in milliseconds, if applicable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            PredictorError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Errors raised while evaluating a dataset.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Unsupported predictor/field combination or invalid engine settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// The predictor was called without a field it requires.
    #[error("incompatible input for sequence {sequence_id} at step {position}: missing {field}")]
    IncompatibleInput {
        sequence_id: String,
        position: usize,
        field: &'static str,
    },

    /// Ground-truth mismatch, incomplete group, or a group emitted twice.
    #[error("group {group} integrity violated: {reason}")]
    GroupIntegrity { group: i64, reason: String },

    /// The predictor failed after the retry budget was spent.
    #[error("predictor failed: {0:#}")]
    Predictor(anyhow::Error),

    /// Writing a trace stream failed.
    #[error("trace output failed: {0}")]
    Trace(#[from] std::io::Error),
}

impl EvalError {
    pub(crate) fn integrity(group: i64, reason: impl Into<String>) -> Self {
        EvalError::GroupIntegrity {
            group,
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error only invalidates the sequence it came from.
    pub fn is_sequence_local(&self) -> bool {
        matches!(self, EvalError::IncompatibleInput { .. })
    }
}
