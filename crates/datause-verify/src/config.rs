//! Pipeline configuration
//!
//! A [`PipelineConfig`] is built once (defaults, then an optional TOML file,
//! then environment overrides) and handed to the runner and evaluation engine
//! at construction time.

use crate::error::{Result, VerifyError};
use crate::models::{LabelSet, PredictionStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// LLM provider backing the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Google Gemini `generateContent`
    #[default]
    Gemini,
    /// `OpenAI`-compatible chat completions
    OpenAi,
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "openai" | "open-ai" => Ok(Self::OpenAi),
            _ => Err(format!("unknown provider '{s}'. Valid options: gemini, openai")),
        }
    }
}

/// Per-strategy toggles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    /// Run the strategy during `predict`
    pub enabled: bool,
    /// Retry failed records after the run
    pub retry_failed: bool,
    /// Load the prompt template from this file instead of the built-in one
    pub template_path: Option<PathBuf>,
}

/// File locations for pipeline inputs and outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPaths {
    /// Samples with text and ground truth
    pub samples: PathBuf,
    /// Long-form prediction table
    pub predictions: PathBuf,
    /// Rule-based feature columns
    pub features: PathBuf,
    /// Directory for evaluation outputs
    pub results_dir: PathBuf,
    /// JSON-lines correction audit log
    pub corrections_log: PathBuf,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            samples: PathBuf::from("data/processed/samples_with_text.csv"),
            predictions: PathBuf::from("data/processed/prediction_llm.csv"),
            features: PathBuf::from("data/processed/features_for_evaluation.csv"),
            results_dir: PathBuf::from("results/tables"),
            corrections_log: PathBuf::from("data/ground_truth/corrections.jsonl"),
        }
    }
}

/// Configuration for prediction, evaluation and review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// LLM provider
    pub provider: Provider,

    /// Model identifier (e.g., "gemini-1.5-flash", "gpt-4o-mini")
    pub model: String,

    /// Override for the provider's API base URL
    pub api_base: Option<String>,

    /// Hard timeout per request, in seconds
    pub request_timeout_secs: u64,

    /// Minimum spacing between request starts, in milliseconds
    pub pacing_interval_ms: u64,

    /// Samples in flight at once
    pub workers: usize,

    /// Full text is cut to this many characters before prompting
    pub max_text_chars: usize,

    /// Text shown per review prompt is cut to this many characters
    pub review_excerpt_chars: usize,

    /// Closed label set accepted from the model and from reviewers
    pub labels: LabelSet,

    /// Fixed label set for metric tables (`None` = labels observed in the data)
    pub metric_labels: Option<LabelSet>,

    /// Per-strategy toggles
    pub strategies: BTreeMap<PredictionStrategy, StrategySettings>,

    /// JSON array of few-shot exemplars replacing the built-in ones
    pub exemplars_path: Option<PathBuf>,

    /// Input and output locations
    pub paths: DataPaths,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let strategies = PredictionStrategy::ALL
            .into_iter()
            .map(|s| {
                let on = s != PredictionStrategy::FulltextFewShotCot;
                (
                    s,
                    StrategySettings {
                        enabled: on,
                        retry_failed: on,
                        template_path: None,
                    },
                )
            })
            .collect();

        Self {
            provider: Provider::Gemini,
            model: "gemini-1.5-flash".to_string(),
            api_base: None,
            request_timeout_secs: 180,
            pacing_interval_ms: 1000,
            workers: 1,
            max_text_chars: 30_000,
            review_excerpt_chars: 30_000,
            labels: LabelSet::default(),
            metric_labels: None,
            strategies,
            exemplars_path: None,
            paths: DataPaths::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file; missing keys take defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables:
    /// - `DATAUSE_PROVIDER`: `gemini` or `openai`
    /// - `DATAUSE_MODEL`: Model name
    /// - `DATAUSE_API_BASE`: API base URL
    /// - `DATAUSE_TIMEOUT_SECS`: Request timeout
    /// - `DATAUSE_PACING_MS`: Minimum inter-request delay
    /// - `DATAUSE_WORKERS`: Concurrent samples
    #[must_use = "returns the config with environment overrides applied"]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(provider) = env::var("DATAUSE_PROVIDER")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.provider = provider;
        }
        if let Ok(model) = env::var("DATAUSE_MODEL") {
            self.model = model;
        }
        if let Ok(base) = env::var("DATAUSE_API_BASE") {
            self.api_base = Some(base);
        }
        if let Some(secs) = env::var("DATAUSE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.request_timeout_secs = secs;
        }
        if let Some(ms) = env::var("DATAUSE_PACING_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.pacing_interval_ms = ms;
        }
        if let Some(workers) = env::var("DATAUSE_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.workers = workers;
        }
        self
    }

    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    /// Returns [`VerifyError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(VerifyError::Config("model name is empty".to_string()));
        }
        if self.workers == 0 {
            return Err(VerifyError::Config("workers must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(VerifyError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_text_chars == 0 {
            return Err(VerifyError::Config(
                "max_text_chars must be positive".to_string(),
            ));
        }
        if self.labels.is_empty() {
            return Err(VerifyError::Config("label set is empty".to_string()));
        }
        if let Some(fixed) = &self.metric_labels {
            if let Some(outside) = fixed.labels().iter().find(|l| !self.labels.contains(**l)) {
                return Err(VerifyError::Config(format!(
                    "metric label '{outside}' is not in the configured label set"
                )));
            }
        }
        Ok(())
    }

    /// Request timeout as a [`Duration`]
    #[inline]
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Pacing interval as a [`Duration`]
    #[inline]
    #[must_use]
    pub const fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }

    /// Settings for `strategy` (defaults to disabled when not listed)
    #[must_use]
    pub fn strategy(&self, strategy: PredictionStrategy) -> StrategySettings {
        self.strategies.get(&strategy).cloned().unwrap_or_default()
    }

    /// Strategies with `enabled = true`, in canonical order
    #[must_use]
    pub fn enabled_strategies(&self) -> Vec<PredictionStrategy> {
        PredictionStrategy::ALL
            .into_iter()
            .filter(|s| self.strategy(*s).enabled)
            .collect()
    }
}
