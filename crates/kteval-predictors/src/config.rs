//! Predictor configuration and factory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use kteval_core::engine::EvalEngineConfig;
use kteval_core::fusion::EarlyFusionHead;
use kteval_core::model::{FieldSet, StepMode};
use kteval_core::traits::Predictor;

use crate::baseline::{ConceptRatePredictor, ConstantPredictor, DEFAULT_PRIOR, DEFAULT_STRENGTH};
use crate::http::HttpPredictor;

/// Name of the predictor created by `KTEVAL_MODEL_URL`.
pub const REMOTE_PREDICTOR: &str = "remote";

/// Configuration for a single predictor.
///
/// Note: Custom Debug impl masks API keys to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredictorConfig {
    /// A served model reached over HTTP.
    Http {
        base_url: String,
        model: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
        /// Auxiliary fields the model reads.
        #[serde(default)]
        requires: FieldSet,
        #[serde(default)]
        early_fusion: Option<EarlyFusionHead>,
    },
    Constant {
        #[serde(default = "default_probability")]
        probability: f64,
    },
    ConceptRate {
        #[serde(default = "default_prior")]
        prior: f64,
        #[serde(default = "default_strength")]
        strength: f64,
        #[serde(default)]
        half_life_secs: Option<f64>,
    },
}

impl std::fmt::Debug for PredictorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PredictorConfig::Http {
                base_url,
                model,
                api_key,
                timeout_secs,
                requires,
                early_fusion,
            } => f
                .debug_struct("Http")
                .field("base_url", base_url)
                .field("model", model)
                .field("api_key", &api_key.as_ref().map(|_| "***"))
                .field("timeout_secs", timeout_secs)
                .field("requires", requires)
                .field("early_fusion", early_fusion)
                .finish(),
            PredictorConfig::Constant { probability } => f
                .debug_struct("Constant")
                .field("probability", probability)
                .finish(),
            PredictorConfig::ConceptRate {
                prior,
                strength,
                half_life_secs,
            } => f
                .debug_struct("ConceptRate")
                .field("prior", prior)
                .field("strength", strength)
                .field("half_life_secs", half_life_secs)
                .finish(),
        }
    }
}

impl PredictorConfig {
    /// Short adapter kind, as shown in listings.
    pub fn kind(&self) -> &'static str {
        match self {
            PredictorConfig::Http { .. } => "http",
            PredictorConfig::Constant { .. } => "constant",
            PredictorConfig::ConceptRate { .. } => "concept_rate",
        }
    }
}

fn default_probability() -> f64 {
    0.5
}
fn default_prior() -> f64 {
    DEFAULT_PRIOR
}
fn default_strength() -> f64 {
    DEFAULT_STRENGTH
}

/// Predictors available without any configuration file.
pub fn builtin_predictors() -> Vec<(&'static str, PredictorConfig)> {
    vec![
        (
            "baseline",
            PredictorConfig::ConceptRate {
                prior: DEFAULT_PRIOR,
                strength: DEFAULT_STRENGTH,
                half_life_secs: None,
            },
        ),
        ("constant", PredictorConfig::Constant { probability: 0.5 }),
    ]
}

/// Top-level kteval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KtevalConfig {
    /// Predictor configurations keyed by name.
    #[serde(default)]
    pub predictors: HashMap<String, PredictorConfig>,
    /// Predictor used when none is given on the command line.
    #[serde(default = "default_predictor")]
    pub default_predictor: String,
    #[serde(default)]
    pub mode: StepMode,
    /// Maximum model input length (history plus query).
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    /// Maximum inputs per predictor call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lanes_per_batch")]
    pub lanes_per_batch: usize,
    /// Max retries on transient predictor errors.
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub early_fusion: bool,
    /// Output directory for reports and traces.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_predictor() -> String {
    "baseline".to_string()
}
fn default_max_len() -> usize {
    kteval_core::window::DEFAULT_MAX_LEN
}
fn default_batch_size() -> usize {
    128
}
fn default_lanes_per_batch() -> usize {
    64
}
fn default_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./kteval-results")
}

impl Default for KtevalConfig {
    fn default() -> Self {
        Self {
            predictors: HashMap::new(),
            default_predictor: default_predictor(),
            mode: StepMode::default(),
            max_len: default_max_len(),
            batch_size: default_batch_size(),
            lanes_per_batch: default_lanes_per_batch(),
            max_retries: default_retries(),
            retry_delay_ms: default_retry_delay(),
            early_fusion: true,
            output_dir: default_output_dir(),
        }
    }
}

impl KtevalConfig {
    /// Looks up a predictor by name, falling back to the built-ins.
    pub fn predictor(&self, name: &str) -> Result<PredictorConfig> {
        if let Some(config) = self.predictors.get(name) {
            return Ok(config.clone());
        }
        builtin_predictors()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| {
                let mut known: Vec<String> = self.predictors.keys().cloned().collect();
                known.extend(builtin_predictors().iter().map(|(n, _)| n.to_string()));
                known.sort();
                known.dedup();
                anyhow::anyhow!(
                    "unknown predictor '{name}' (available: {})",
                    known.join(", ")
                )
            })
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EvalEngineConfig {
        EvalEngineConfig {
            mode: self.mode,
            max_len: self.max_len,
            batch_size: self.batch_size,
            lanes_per_batch: self.lanes_per_batch,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            early_fusion: self.early_fusion,
        }
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let value = std::env::var(&result[start + 2..start + end]).unwrap_or_default();
        result.replace_range(start..start + end + 1, &value);
    }
    result
}

fn resolve_predictor_config(config: &PredictorConfig) -> PredictorConfig {
    match config {
        PredictorConfig::Http {
            base_url,
            model,
            api_key,
            timeout_secs,
            requires,
            early_fusion,
        } => PredictorConfig::Http {
            base_url: resolve_env_vars(base_url),
            model: resolve_env_vars(model),
            api_key: api_key
                .as_deref()
                .map(resolve_env_vars)
                .filter(|k| !k.is_empty()),
            timeout_secs: *timeout_secs,
            requires: *requires,
            early_fusion: early_fusion.clone(),
        },
        other => other.clone(),
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `kteval.toml` in the current directory
/// 2. `~/.config/kteval/config.toml`
///
/// Environment variable overrides: `KTEVAL_MODEL_URL` (adds or repoints the
/// `remote` predictor), `KTEVAL_MODEL` and `KTEVAL_API_KEY`.
pub fn load_config() -> Result<KtevalConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<KtevalConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from("kteval.toml");
            if local.exists() {
                Some(local)
            } else {
                dirs_path()
                    .map(|home| home.join("config.toml"))
                    .filter(|global| global.exists())
            }
        }
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            toml::from_str::<KtevalConfig>(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => KtevalConfig::default(),
    };

    apply_env_overrides(&mut config);

    config.predictors = config
        .predictors
        .iter()
        .map(|(k, v)| (k.clone(), resolve_predictor_config(v)))
        .collect();

    Ok(config)
}

fn apply_env_overrides(config: &mut KtevalConfig) {
    if let Ok(url) = std::env::var("KTEVAL_MODEL_URL") {
        config
            .predictors
            .entry(REMOTE_PREDICTOR.into())
            .or_insert(PredictorConfig::Http {
                base_url: String::new(),
                model: "default".into(),
                api_key: None,
                timeout_secs: None,
                requires: FieldSet::default(),
                early_fusion: None,
            });
        if let Some(PredictorConfig::Http { base_url, .. }) =
            config.predictors.get_mut(REMOTE_PREDICTOR)
        {
            *base_url = url;
        }
    }

    if let Some(PredictorConfig::Http { model, api_key, .. }) =
        config.predictors.get_mut(REMOTE_PREDICTOR)
    {
        if let Ok(m) = std::env::var("KTEVAL_MODEL") {
            *model = m;
        }
        if let Ok(key) = std::env::var("KTEVAL_API_KEY") {
            *api_key = Some(key);
        }
    }
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("kteval"))
}

/// Create a predictor instance from its configuration.
pub fn create_predictor(name: &str, config: &PredictorConfig) -> Result<Arc<dyn Predictor>> {
    let predictor: Arc<dyn Predictor> = match config {
        PredictorConfig::Http {
            base_url,
            model,
            api_key,
            timeout_secs,
            requires,
            early_fusion,
        } => {
            if base_url.is_empty() {
                anyhow::bail!("predictor '{name}' has no base_url");
            }
            Arc::new(
                HttpPredictor::new(name, base_url, model.clone(), api_key.clone(), *timeout_secs)?
                    .with_requirements(*requires)
                    .with_fusion_head(early_fusion.clone()),
            )
        }
        PredictorConfig::Constant { probability } => {
            Arc::new(ConstantPredictor::new(name, *probability)?)
        }
        PredictorConfig::ConceptRate {
            prior,
            strength,
            half_life_secs,
        } => Arc::new(ConceptRatePredictor::new(
            name,
            *prior,
            *strength,
            *half_life_secs,
        )?),
    };
    Ok(predictor)
}
