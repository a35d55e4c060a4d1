//! kteval-predictors — Predictor adapters for kteval.
//!
//! Implements the `Predictor` trait for served models over HTTP and for
//! reference baselines, and loads predictor configuration from TOML.

pub mod baseline;
pub mod config;
pub mod error;
pub mod http;
pub mod mock;

pub use config::{
    builtin_predictors, create_predictor, load_config, load_config_from, KtevalConfig,
    PredictorConfig,
};
pub use error::PredictorError;
