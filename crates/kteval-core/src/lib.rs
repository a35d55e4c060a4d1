//! kteval-core — Evaluation engine for knowledge-tracing predictors.
//!
//! This crate defines the data model, the predictor capability, and the
//! evaluation pipeline the rest of kteval builds on: context windows, the
//! step adapter, the stepper, batch regrouping, fusion and metrics.

pub mod adapter;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod metrics;
pub mod model;
pub mod regroup;
pub mod report;
pub mod stepper;
pub mod trace;
pub mod traits;
pub mod window;

pub use error::{EvalError, PredictorError};
